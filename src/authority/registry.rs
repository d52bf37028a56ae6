//! Session Registry
//!
//! Tracks the sessions the reference authority has issued:
//! - In-memory storage behind an async `RwLock`
//! - Expiry decided by the authority's clock
//! - Cleanup of expired sessions (driven by the authority's cleanup task)

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{Result, UploadError};

/// An issued upload session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: String,
    pub upload_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Issued sessions, indexed by session ID
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    sessions: RwLock<HashMap<String, SessionRecord>>,
    clock: Arc<dyn Clock>,
}

impl SessionRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: RwLock::new(HashMap::new()),
                clock,
            }),
        }
    }

    /// Issue a session for an upload batch
    pub async fn create(&self, upload_id: &str, ttl: Duration) -> SessionRecord {
        let now = self.inner.clock.now();
        let record = SessionRecord {
            session_id: Uuid::new_v4().to_string(),
            upload_id: upload_id.to_string(),
            created_at: now,
            expires_at: now + ttl,
        };

        self.inner
            .sessions
            .write()
            .await
            .insert(record.session_id.clone(), record.clone());

        tracing::info!(
            session_id = %record.session_id,
            upload_id = %upload_id,
            expires_at = %record.expires_at,
            "Created upload session"
        );

        record
    }

    /// Look up a session that must be live and belong to `upload_id`
    pub async fn validate(&self, session_id: &str, upload_id: &str) -> Result<SessionRecord> {
        let sessions = self.inner.sessions.read().await;
        let record = sessions
            .get(session_id)
            .filter(|r| r.upload_id == upload_id)
            .ok_or_else(|| UploadError::SessionNotFound(session_id.to_string()))?;

        if record.is_expired_at(self.inner.clock.now()) {
            return Err(UploadError::SessionExpired(session_id.to_string()));
        }

        Ok(record.clone())
    }

    pub async fn session_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    /// Upload batches with at least one unexpired session
    pub async fn live_uploads(&self) -> HashSet<String> {
        let now = self.inner.clock.now();
        self.inner
            .sessions
            .read()
            .await
            .values()
            .filter(|record| !record.is_expired_at(now))
            .map(|record| record.upload_id.clone())
            .collect()
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    /// Drop expired sessions
    ///
    /// Returns the number of sessions cleaned up
    pub async fn cleanup_expired(&self) -> usize {
        let now = self.inner.clock.now();
        let mut sessions = self.inner.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, record| !record.is_expired_at(now));
        let count = before - sessions.len();

        if count > 0 {
            tracing::info!(count = count, "Cleaned up expired upload sessions");
        }

        count
    }
}

// ============================================================================
// Tests
// ============================================================================

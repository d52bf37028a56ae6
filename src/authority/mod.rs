//! Reference Upload Authority
//!
//! An in-memory upload authority that issues sessions, stores chunks and
//! answers verification queries. It backs the `shutter-authority` binary and
//! doubles as an in-process collaborator for the pipeline.
//!
//! Endpoints (see `routes`):
//! - POST /api/v1/uploads/sessions - Submit a manifest, receive an acknowledgment
//! - PUT /api/v1/uploads/:upload_id/files/:file_id/chunks/:index - Deliver a chunk
//! - GET /api/v1/uploads/:upload_id/files/:file_id - What was received for a file

pub mod registry;
pub mod routes;
pub mod store;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Duration;

use crate::clock::{Clock, SystemClock};
use crate::config::ServerConfig;
use crate::error::Result;
use crate::hashing::manifest_checksum;
use crate::manifest::UploadManifest;
use crate::session::{SessionAcknowledgment, TransferTarget};
use crate::traits::{ChunkDestination, ChunkPayload, ReceivedFile, UploadAuthority};

pub use registry::{SessionRecord, SessionRegistry};
pub use routes::{app, router};
pub use store::ChunkStore;

/// API prefix the reference authority serves under
pub const API_PREFIX: &str = "/api/v1/uploads";

/// Reference authority policy
#[derive(Debug, Clone)]
pub struct AuthoritySettings {
    /// Externally reachable base URL, used to build transfer targets
    pub public_url: String,
    pub session_ttl: Duration,
    pub max_chunk_size: u64,
    pub allowed_retries: u32,
    pub max_file_size: u64,
}

impl Default for AuthoritySettings {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for AuthoritySettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            public_url: config.public_url.clone(),
            session_ttl: Duration::seconds(config.session_ttl_secs),
            max_chunk_size: config.max_chunk_size,
            allowed_retries: config.allowed_retries,
            max_file_size: config.max_file_size,
        }
    }
}

// ============================================================================
// Authority
// ============================================================================

/// In-memory upload authority
#[derive(Clone)]
pub struct ReferenceAuthority {
    inner: Arc<AuthorityInner>,
}

struct AuthorityInner {
    settings: AuthoritySettings,
    clock: Arc<dyn Clock>,
    sessions: SessionRegistry,
    chunks: ChunkStore,
}

impl ReferenceAuthority {
    pub fn new(settings: AuthoritySettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    pub fn with_clock(settings: AuthoritySettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(AuthorityInner {
                sessions: SessionRegistry::new(clock.clone()),
                chunks: ChunkStore::new(clock.clone()),
                settings,
                clock,
            }),
        }
    }

    pub fn settings(&self) -> &AuthoritySettings {
        &self.inner.settings
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    pub fn chunks(&self) -> &ChunkStore {
        &self.inner.chunks
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    /// Drop expired sessions, then evict batches left without one
    ///
    /// A batch is kept for one session TTL after its last activity so a
    /// client can still re-negotiate and resume. Returns the number of
    /// sessions and batches removed.
    pub async fn cleanup(&self) -> (usize, usize) {
        let sessions = self.inner.sessions.cleanup_expired().await;
        let live = self.inner.sessions.live_uploads().await;
        let batches = self
            .inner
            .chunks
            .cleanup_orphaned(&live, self.inner.settings.session_ttl)
            .await;
        (sessions, batches)
    }

    /// Start background cleanup task
    pub fn start_cleanup_task(self, every: StdDuration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);

            loop {
                interval.tick().await;
                self.cleanup().await;
            }
        })
    }

    /// Transfer target for one file of a batch
    pub fn target_for(&self, upload_id: &str, file_id: &str) -> TransferTarget {
        TransferTarget::new(format!(
            "{}{}/{}/files/{}",
            self.inner.settings.public_url.trim_end_matches('/'),
            API_PREFIX,
            urlencoding::encode(upload_id),
            urlencoding::encode(file_id)
        ))
    }

    /// Accept or reject a manifest
    ///
    /// Policy rejections come back as `success: false` with a reason.
    pub async fn accept_manifest(&self, manifest: &UploadManifest) -> SessionAcknowledgment {
        let settings = &self.inner.settings;

        if let Err(reason) = self.check_manifest(manifest) {
            return self.rejection(manifest, reason);
        }

        let chunk_size = manifest.chunk_size().min(settings.max_chunk_size);
        if let Err(e) = self.inner.chunks.register(manifest, chunk_size).await {
            return self.rejection(manifest, e.to_string());
        }

        let session = self
            .inner
            .sessions
            .create(&manifest.upload_id, settings.session_ttl)
            .await;

        let destinations: HashMap<String, TransferTarget> = manifest
            .files
            .iter()
            .map(|e| {
                (
                    e.file_id.clone(),
                    self.target_for(&manifest.upload_id, &e.file_id),
                )
            })
            .collect();

        tracing::info!(
            upload_id = %manifest.upload_id,
            principal_id = %manifest.principal_id,
            session_id = %session.session_id,
            files = manifest.file_count,
            total_size = manifest.total_size,
            "Manifest accepted"
        );

        SessionAcknowledgment {
            success: true,
            session_id: session.session_id,
            expires_at: session.expires_at,
            destinations,
            max_chunk_size: settings.max_chunk_size,
            allowed_retries: settings.allowed_retries,
            message: format!("{} files authorized", manifest.file_count),
        }
    }

    /// Accept one chunk under a live session
    pub async fn receive_chunk(&self, chunk: ChunkPayload<'_>) -> Result<usize> {
        self.inner
            .sessions
            .validate(chunk.session_id, chunk.upload_id)
            .await?;

        self.inner
            .chunks
            .store_chunk(
                chunk.upload_id,
                chunk.file_id,
                chunk.chunk_index,
                chunk.data,
                chunk.checksum,
            )
            .await
    }

    /// What has been received for a file
    pub async fn file_status(&self, upload_id: &str, file_id: &str) -> Option<ReceivedFile> {
        self.inner.chunks.received_file(upload_id, file_id).await
    }

    fn check_manifest(&self, manifest: &UploadManifest) -> std::result::Result<(), String> {
        let settings = &self.inner.settings;

        if manifest.files.is_empty() || manifest.file_count != manifest.files.len() {
            return Err("file count does not match manifest entries".to_string());
        }

        if manifest_checksum(manifest.files.iter().map(|e| &e.checksum)) != manifest.manifest_checksum
        {
            return Err("manifest checksum does not match file digests".to_string());
        }

        for entry in &manifest.files {
            if entry.size > settings.max_file_size {
                return Err(format!(
                    "file {} too large: {} bytes (max: {})",
                    entry.file_id, entry.size, settings.max_file_size
                ));
            }

            if !is_valid_media_type(&entry.mime_type) {
                return Err(format!(
                    "unsupported media type for {}: {}",
                    entry.file_id, entry.mime_type
                ));
            }

            if entry.chunk_size == 0 || entry.chunk_count != entry.plan().chunk_count {
                return Err(format!("inconsistent chunk plan for {}", entry.file_id));
            }
        }

        Ok(())
    }

    fn rejection(&self, manifest: &UploadManifest, reason: String) -> SessionAcknowledgment {
        tracing::warn!(
            upload_id = %manifest.upload_id,
            reason = %reason,
            "Manifest rejected"
        );

        SessionAcknowledgment {
            success: false,
            session_id: String::new(),
            expires_at: self.inner.clock.now(),
            destinations: HashMap::new(),
            max_chunk_size: self.inner.settings.max_chunk_size,
            allowed_retries: 0,
            message: reason,
        }
    }
}

/// Capture formats only: stills and video
fn is_valid_media_type(mime_type: &str) -> bool {
    mime_type.starts_with("image/") || mime_type.starts_with("video/")
}

#[async_trait]
impl UploadAuthority for ReferenceAuthority {
    async fn open_session(&self, manifest: &UploadManifest) -> Result<SessionAcknowledgment> {
        Ok(self.accept_manifest(manifest).await)
    }

    async fn received_file(&self, upload_id: &str, file_id: &str) -> Result<Option<ReceivedFile>> {
        Ok(self.file_status(upload_id, file_id).await)
    }
}

#[async_trait]
impl ChunkDestination for ReferenceAuthority {
    async fn put_chunk(&self, _target: &TransferTarget, chunk: ChunkPayload<'_>) -> Result<()> {
        self.receive_chunk(chunk).await.map(|_| ())
    }
}

// ============================================================================
// Tests
// ============================================================================

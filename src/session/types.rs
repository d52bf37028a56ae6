//! Session types

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, UploadError};
use crate::manifest::{ChunkPlan, FileManifestEntry, UploadManifest};

/// Authorized transfer target for one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferTarget {
    pub url: String,
}

impl TransferTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// URL a given chunk is delivered to
    pub fn chunk_url(&self, chunk_index: usize) -> String {
        format!("{}/chunks/{}", self.url.trim_end_matches('/'), chunk_index)
    }
}

/// Authority's response to a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAcknowledgment {
    pub success: bool,

    #[serde(default)]
    pub session_id: String,

    pub expires_at: DateTime<Utc>,

    /// File ID -> transfer target
    #[serde(default)]
    pub destinations: HashMap<String, TransferTarget>,

    /// Largest chunk the authority accepts
    #[serde(default)]
    pub max_chunk_size: u64,

    /// Attempts allowed per chunk
    #[serde(default)]
    pub allowed_retries: u32,

    #[serde(default)]
    pub message: String,
}

impl SessionAcknowledgment {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// A validated acknowledgment bound to the manifest it answers
#[derive(Debug, Clone)]
pub struct NegotiatedSession {
    ack: SessionAcknowledgment,
    upload_id: String,
    chunk_size: u64,
}

impl NegotiatedSession {
    /// Validate an acknowledgment against its manifest
    pub fn from_ack(
        ack: SessionAcknowledgment,
        manifest: &UploadManifest,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if !ack.success {
            let reason = if ack.message.is_empty() {
                "no reason given".to_string()
            } else {
                ack.message.clone()
            };
            return Err(UploadError::SessionRejected(reason));
        }

        if ack.session_id.is_empty() {
            return Err(UploadError::InvalidAcknowledgment(
                "accepted without a session id".to_string(),
            ));
        }

        if ack.max_chunk_size == 0 {
            return Err(UploadError::InvalidAcknowledgment(
                "chunk size ceiling is zero".to_string(),
            ));
        }

        if ack.is_expired_at(now) {
            return Err(UploadError::SessionExpired(ack.session_id.clone()));
        }

        if let Some(unknown) = ack
            .destinations
            .keys()
            .find(|file_id| manifest.entry(file_id).is_none())
        {
            return Err(UploadError::InvalidAcknowledgment(format!(
                "destination issued for file not in manifest: {}",
                unknown
            )));
        }

        if let Some(missing) = manifest
            .files
            .iter()
            .find(|e| !ack.destinations.contains_key(&e.file_id))
        {
            return Err(UploadError::DestinationNotFound(missing.file_id.clone()));
        }

        let chunk_size = manifest.chunk_size().min(ack.max_chunk_size);

        Ok(Self {
            ack,
            upload_id: manifest.upload_id.clone(),
            chunk_size,
        })
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn session_id(&self) -> &str {
        &self.ack.session_id
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.ack.expires_at
    }

    pub fn allowed_retries(&self) -> u32 {
        self.ack.allowed_retries
    }

    /// Effective chunk size: manifest size clamped to the authority ceiling
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Fail fast if the session window has closed
    pub fn ensure_active(&self, now: DateTime<Utc>) -> Result<()> {
        if self.ack.is_expired_at(now) {
            return Err(UploadError::SessionExpired(self.ack.session_id.clone()));
        }
        Ok(())
    }

    pub fn destination(&self, file_id: &str) -> Result<&TransferTarget> {
        self.ack
            .destinations
            .get(file_id)
            .ok_or_else(|| UploadError::DestinationNotFound(file_id.to_string()))
    }

    /// Chunk layout of a file under this session
    pub fn plan_for(&self, entry: &FileManifestEntry) -> ChunkPlan {
        ChunkPlan::new(entry.size, self.chunk_size)
    }
}

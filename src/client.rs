//! HTTP collaborators
//!
//! `reqwest` implementations of `UploadAuthority` and `ChunkDestination`
//! speaking the reference authority's wire format.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::config::PipelineConfig;
use crate::error::{Result, UploadError};
use crate::manifest::UploadManifest;
use crate::session::{SessionAcknowledgment, TransferTarget};
use crate::traits::{ChunkDestination, ChunkPayload, ReceivedFile, UploadAuthority};

/// Session ID a chunk is delivered under
pub const UPLOAD_SESSION_HEADER: &str = "x-upload-session";

/// 0-based chunk index
pub const CHUNK_INDEX_HEADER: &str = "x-chunk-index";

/// Hex SHA-256 of the chunk body
pub const CHUNK_CHECKSUM_HEADER: &str = "x-chunk-checksum";

fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| UploadError::Authority(format!("Failed to build HTTP client: {}", e)))
}

// ============================================================================
// Upload Authority
// ============================================================================

/// Upload authority reached over HTTP
#[derive(Debug, Clone)]
pub struct HttpUploadAuthority {
    client: reqwest::Client,
    base_url: String,
}

impl HttpUploadAuthority {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        Self::new(&config.authority_url, config.request_timeout)
    }

    fn sessions_url(&self) -> String {
        format!("{}/sessions", self.base_url)
    }

    fn file_url(&self, upload_id: &str, file_id: &str) -> String {
        format!(
            "{}/{}/files/{}",
            self.base_url,
            urlencoding::encode(upload_id),
            urlencoding::encode(file_id)
        )
    }
}

#[async_trait]
impl UploadAuthority for HttpUploadAuthority {
    async fn open_session(&self, manifest: &UploadManifest) -> Result<SessionAcknowledgment> {
        let response = self
            .client
            .post(self.sessions_url())
            .json(manifest)
            .send()
            .await
            .map_err(|e| UploadError::Authority(format!("Failed to submit manifest: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // Server-side trouble is worth another attempt; a refusal is not
            if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                return Err(UploadError::Authority(format!(
                    "Authority returned {}: {}",
                    status, body
                )));
            }
            return Err(UploadError::SessionRejected(format!("{}: {}", status, body)));
        }

        response
            .json()
            .await
            .map_err(|e| UploadError::Authority(format!("Failed to parse acknowledgment: {}", e)))
    }

    async fn received_file(&self, upload_id: &str, file_id: &str) -> Result<Option<ReceivedFile>> {
        let response = self
            .client
            .get(self.file_url(upload_id, file_id))
            .send()
            .await
            .map_err(|e| UploadError::Authority(format!("Failed to query {}: {}", file_id, e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UploadError::Authority(format!(
                "Authority returned {}: {}",
                status, body
            )));
        }

        response
            .json()
            .await
            .map(Some)
            .map_err(|e| UploadError::Authority(format!("Failed to parse file status: {}", e)))
    }
}

// ============================================================================
// Chunk Destination
// ============================================================================

/// Chunk destination reached over HTTP
#[derive(Debug, Clone)]
pub struct HttpChunkDestination {
    client: reqwest::Client,
}

impl HttpChunkDestination {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
        })
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        Self::new(config.request_timeout)
    }
}

#[async_trait]
impl ChunkDestination for HttpChunkDestination {
    async fn put_chunk(&self, target: &TransferTarget, chunk: ChunkPayload<'_>) -> Result<()> {
        let failed = |reason: String| UploadError::ChunkTransfer {
            file_id: chunk.file_id.to_string(),
            chunk_index: chunk.chunk_index,
            reason,
        };

        let response = self
            .client
            .put(target.chunk_url(chunk.chunk_index))
            .header(UPLOAD_SESSION_HEADER, chunk.session_id)
            .header(CHUNK_INDEX_HEADER, chunk.chunk_index.to_string())
            .header(CHUNK_CHECKSUM_HEADER, chunk.checksum.as_str())
            .body(chunk.data.to_vec())
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::GONE {
            return Err(UploadError::SessionExpired(chunk.session_id.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(failed(format!("{}: {}", status, body)));
        }

        Ok(())
    }
}

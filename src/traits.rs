//! Boundary traits for the external collaborators
//!
//! The pipeline never talks to the network directly; it goes through an
//! `UploadAuthority` (negotiation and verification queries) and a
//! `ChunkDestination` (chunk payload delivery).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::hashing::Checksum;
use crate::manifest::UploadManifest;
use crate::session::{SessionAcknowledgment, TransferTarget};

/// The authority's record of what it received for one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedFile {
    pub file_id: String,

    /// Bytes received
    pub size: u64,

    /// Digest over the received bytes, if any were received
    #[serde(default)]
    pub checksum: Option<Checksum>,

    /// Chunks received
    #[serde(default)]
    pub chunks_received: usize,
}

/// One chunk on its way to a destination
#[derive(Debug, Clone, Copy)]
pub struct ChunkPayload<'a> {
    pub upload_id: &'a str,
    pub session_id: &'a str,
    pub file_id: &'a str,
    pub chunk_index: usize,
    pub checksum: &'a Checksum,
    pub data: &'a [u8],
}

/// Server-side authority that issues sessions and confirms receipt
#[async_trait]
pub trait UploadAuthority: Send + Sync {
    /// Submit a manifest and receive an acknowledgment
    async fn open_session(&self, manifest: &UploadManifest) -> Result<SessionAcknowledgment>;

    /// Query what was received for a file; `None` if nothing is known
    async fn received_file(&self, upload_id: &str, file_id: &str) -> Result<Option<ReceivedFile>>;
}

/// Object storage destination accepting chunk payloads
#[async_trait]
pub trait ChunkDestination: Send + Sync {
    /// Deliver a full chunk payload to an authorized target
    async fn put_chunk(&self, target: &TransferTarget, chunk: ChunkPayload<'_>) -> Result<()>;
}

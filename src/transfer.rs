//! Chunked Transfer Engine
//!
//! Slices a file per the session's chunk plan, checksums each chunk and
//! delivers it to the file's destination, strictly in index order.
//!
//! The engine makes one attempt per chunk. A failed delivery produces a
//! failed `ChunkVerification` and ends the pass; the caller decides whether
//! to resume from that index.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cancel::CancellationSignal;
use crate::clock::Clock;
use crate::error::{Result, UploadError};
use crate::hashing::{digest, Checksum};
use crate::manifest::{ChunkPlan, FileManifestEntry, PendingFile};
use crate::session::{NegotiatedSession, TransferTarget};
use crate::traits::{ChunkDestination, ChunkPayload};

// ============================================================================
// Records
// ============================================================================

/// Outcome of one chunk transfer attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkVerification {
    pub chunk_index: usize,

    pub chunk_checksum: Checksum,

    pub verified: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChunkVerification {
    pub fn verified(chunk_index: usize, chunk_checksum: Checksum) -> Self {
        Self {
            chunk_index,
            chunk_checksum,
            verified: true,
            error: None,
        }
    }

    pub fn failed(chunk_index: usize, chunk_checksum: Checksum, error: impl Into<String>) -> Self {
        Self {
            chunk_index,
            chunk_checksum,
            verified: false,
            error: Some(error.into()),
        }
    }
}

/// Accumulated transfer state for one file
///
/// `chunks` holds the successful record for each index, in order.
/// `attempts` holds every attempt, failed ones included.
#[derive(Debug, Clone, Default)]
pub struct FileTransferRecord {
    pub file_id: String,
    pub chunks: Vec<ChunkVerification>,
    pub attempts: Vec<ChunkVerification>,
}

impl FileTransferRecord {
    pub fn new(file_id: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            ..Self::default()
        }
    }

    /// First index without a verified record
    pub fn next_index(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_complete(&self, plan: &ChunkPlan) -> bool {
        self.chunks.len() == plan.chunk_count
    }

    /// Attempts made so far for one index
    pub fn attempts_for(&self, chunk_index: usize) -> u32 {
        self.attempts
            .iter()
            .filter(|a| a.chunk_index == chunk_index)
            .count() as u32
    }

    /// Append an attempt; verified attempts extend the contiguous prefix
    pub fn push(&mut self, attempt: ChunkVerification) {
        if attempt.verified && attempt.chunk_index == self.chunks.len() {
            self.chunks.push(attempt.clone());
        }
        self.attempts.push(attempt);
    }

    pub fn last_failure(&self) -> Option<&ChunkVerification> {
        self.attempts.last().filter(|a| !a.verified)
    }
}

/// What one pass over a file produced
#[derive(Debug, Default)]
pub struct TransferPass {
    /// Attempts made in this pass, in index order
    pub records: Vec<ChunkVerification>,

    /// Error that stopped the pass before a chunk could be attempted
    pub interrupted: Option<UploadError>,
}

// ============================================================================
// Engine
// ============================================================================

/// Transfers file chunks to their destinations
#[derive(Clone)]
pub struct ChunkedTransferEngine {
    destination: Arc<dyn ChunkDestination>,
    clock: Arc<dyn Clock>,
    cancel: CancellationSignal,
}

impl ChunkedTransferEngine {
    pub fn new(
        destination: Arc<dyn ChunkDestination>,
        clock: Arc<dyn Clock>,
        cancel: CancellationSignal,
    ) -> Self {
        Self {
            destination,
            clock,
            cancel,
        }
    }

    /// Transfer chunks `start_index..chunk_count` of a file, in order
    ///
    /// `on_progress(completed, total)` is called after every verified chunk.
    /// The pass ends early at the first failed chunk, whose failed record is
    /// the last one returned. Expiry, cancellation and read failures end the
    /// pass as `interrupted`, keeping the records made before them.
    pub async fn transfer_file<F>(
        &self,
        file: &PendingFile,
        entry: &FileManifestEntry,
        session: &NegotiatedSession,
        start_index: usize,
        mut on_progress: F,
    ) -> TransferPass
    where
        F: FnMut(usize, usize) + Send,
    {
        let mut pass = TransferPass::default();

        let target = match session.destination(&entry.file_id) {
            Ok(target) => target,
            Err(e) => {
                pass.interrupted = Some(e);
                return pass;
            }
        };
        let plan = session.plan_for(entry);
        pass.records.reserve(plan.chunk_count.saturating_sub(start_index));

        for index in start_index..plan.chunk_count {
            let record = match self
                .transfer_chunk(file, entry, session, target, &plan, index)
                .await
            {
                Ok(record) => record,
                Err(e) => {
                    pass.interrupted = Some(e);
                    break;
                }
            };
            let verified = record.verified;
            pass.records.push(record);

            if !verified {
                break;
            }
            on_progress(index + 1, plan.chunk_count);
        }

        pass
    }

    /// One attempt at one chunk
    ///
    /// Cancellation and session expiry are checked before the destination is
    /// contacted. Destination failures are returned as a failed record;
    /// read failures, expiry and cancellation are returned as errors.
    pub async fn transfer_chunk(
        &self,
        file: &PendingFile,
        entry: &FileManifestEntry,
        session: &NegotiatedSession,
        target: &TransferTarget,
        plan: &ChunkPlan,
        index: usize,
    ) -> Result<ChunkVerification> {
        if self.cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let range = plan.range(index).ok_or(UploadError::ChunkIndexOutOfBounds {
            index,
            count: plan.chunk_count,
        })?;

        let data = file
            .source
            .read_range(range)
            .await
            .map_err(|source| UploadError::Read {
                file_id: entry.file_id.clone(),
                source,
            })?;
        let checksum = digest(&data);

        session.ensure_active(self.clock.now())?;

        let payload = ChunkPayload {
            upload_id: session.upload_id(),
            session_id: session.session_id(),
            file_id: &entry.file_id,
            chunk_index: index,
            checksum: &checksum,
            data: &data,
        };

        match self.destination.put_chunk(target, payload).await {
            Ok(()) => {
                tracing::debug!(
                    file_id = %entry.file_id,
                    chunk_index = index,
                    chunk_count = plan.chunk_count,
                    size = data.len(),
                    checksum = %checksum,
                    "Chunk transferred"
                );
                Ok(ChunkVerification::verified(index, checksum))
            }
            Err(e) if e.requires_renegotiation() => Err(e),
            Err(e) => {
                tracing::warn!(
                    file_id = %entry.file_id,
                    chunk_index = index,
                    error = %e,
                    "Chunk transfer failed"
                );
                Ok(ChunkVerification::failed(index, checksum, e.to_string()))
            }
        }
    }
}

//! Chunk Store
//!
//! In-memory storage for received chunks, grouped by upload batch and file.
//! Batches outlive individual sessions so a re-negotiated session keeps
//! what was already received. A batch with no live session that has been
//! idle past the retention window is evicted by `cleanup_orphaned`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::error::{Result, UploadError};
use crate::hashing::{digest, digest_parts, Checksum};
use crate::manifest::{ChunkPlan, UploadManifest};
use crate::traits::ReceivedFile;

/// Expected layout and received chunks of one file
#[derive(Debug, Clone)]
struct FileSlot {
    plan: ChunkPlan,
    chunks: BTreeMap<usize, Vec<u8>>,
}

impl FileSlot {
    fn is_complete(&self) -> bool {
        self.chunks.len() == self.plan.chunk_count
    }
}

/// A registered upload batch
#[derive(Debug, Clone)]
struct BatchRecord {
    manifest_checksum: String,
    files: HashMap<String, FileSlot>,
    last_activity: DateTime<Utc>,
}

// ============================================================================
// Chunk Store
// ============================================================================

/// Received chunks for every registered batch
#[derive(Clone)]
pub struct ChunkStore {
    batches: Arc<RwLock<HashMap<String, BatchRecord>>>,
    clock: Arc<dyn Clock>,
}

impl ChunkStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            batches: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    /// Register a batch, or confirm a re-submission of the same batch
    ///
    /// A re-submission keeps received chunks when the chunk size is unchanged.
    /// Under a new chunk size only fully received files keep their chunks.
    /// Reusing an upload ID for different contents is rejected.
    pub async fn register(&self, manifest: &UploadManifest, chunk_size: u64) -> Result<()> {
        let now = self.clock.now();
        let mut batches = self.batches.write().await;

        if let Some(existing) = batches.get_mut(&manifest.upload_id) {
            if existing.manifest_checksum != manifest.manifest_checksum {
                return Err(UploadError::InvalidInput(format!(
                    "upload {} already registered with different contents",
                    manifest.upload_id
                )));
            }

            existing.last_activity = now;
            for (file_id, slot) in existing.files.iter_mut() {
                if slot.plan.chunk_size != chunk_size && !slot.is_complete() {
                    tracing::info!(
                        upload_id = %manifest.upload_id,
                        file_id = %file_id,
                        "Chunk size changed, discarding received chunks"
                    );
                    slot.plan = ChunkPlan::new(slot.plan.file_size, chunk_size);
                    slot.chunks.clear();
                }
            }
            return Ok(());
        }

        let files = manifest
            .files
            .iter()
            .map(|entry| {
                let slot = FileSlot {
                    plan: ChunkPlan::new(entry.size, chunk_size),
                    chunks: BTreeMap::new(),
                };
                (entry.file_id.clone(), slot)
            })
            .collect();

        batches.insert(
            manifest.upload_id.clone(),
            BatchRecord {
                manifest_checksum: manifest.manifest_checksum.clone(),
                files,
                last_activity: now,
            },
        );

        Ok(())
    }

    /// Store a chunk after verifying its digest
    ///
    /// Returns the number of chunks held for the file.
    pub async fn store_chunk(
        &self,
        upload_id: &str,
        file_id: &str,
        chunk_index: usize,
        data: &[u8],
        expected: &Checksum,
    ) -> Result<usize> {
        let actual = digest(data);
        if &actual != expected {
            return Err(UploadError::ChunkChecksumMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }

        let mut batches = self.batches.write().await;
        let batch = batches
            .get_mut(upload_id)
            .ok_or_else(|| UploadError::SessionNotFound(upload_id.to_string()))?;
        batch.last_activity = self.clock.now();
        let slot = batch
            .files
            .get_mut(file_id)
            .ok_or_else(|| UploadError::DestinationNotFound(file_id.to_string()))?;

        let expected_len = slot
            .plan
            .range(chunk_index)
            .ok_or(UploadError::ChunkIndexOutOfBounds {
                index: chunk_index,
                count: slot.plan.chunk_count,
            })?;
        let expected_len = expected_len.end - expected_len.start;
        if data.len() as u64 != expected_len {
            return Err(UploadError::InvalidInput(format!(
                "chunk {} of {} is {} bytes, expected {}",
                chunk_index,
                file_id,
                data.len(),
                expected_len
            )));
        }

        slot.chunks.insert(chunk_index, data.to_vec());

        tracing::debug!(
            upload_id = %upload_id,
            file_id = %file_id,
            chunk_index = chunk_index,
            chunks_received = slot.chunks.len(),
            total_chunks = slot.plan.chunk_count,
            "Chunk stored"
        );

        Ok(slot.chunks.len())
    }

    /// What has been received for a file, assembled in index order
    pub async fn received_file(&self, upload_id: &str, file_id: &str) -> Option<ReceivedFile> {
        let batches = self.batches.read().await;
        let slot = batches.get(upload_id)?.files.get(file_id)?;

        let size = slot.chunks.values().map(|c| c.len() as u64).sum();
        let checksum = (!slot.chunks.is_empty())
            .then(|| digest_parts(slot.chunks.values().map(Vec::as_slice)));

        Some(ReceivedFile {
            file_id: file_id.to_string(),
            size,
            checksum,
            chunks_received: slot.chunks.len(),
        })
    }

    /// Drop a batch and its chunks
    pub async fn remove(&self, upload_id: &str) -> bool {
        self.batches.write().await.remove(upload_id).is_some()
    }

    pub async fn batch_count(&self) -> usize {
        self.batches.read().await.len()
    }

    /// Evict batches without a live session that have been idle for longer
    /// than `retention`
    ///
    /// Returns the number of batches evicted
    pub async fn cleanup_orphaned(
        &self,
        live_uploads: &HashSet<String>,
        retention: Duration,
    ) -> usize {
        let cutoff = self.clock.now() - retention;

        let orphaned: Vec<String> = {
            let batches = self.batches.read().await;
            batches
                .iter()
                .filter(|(upload_id, batch)| {
                    !live_uploads.contains(*upload_id) && batch.last_activity < cutoff
                })
                .map(|(upload_id, _)| upload_id.clone())
                .collect()
        };

        let mut count = 0;
        for upload_id in orphaned {
            if self.remove(&upload_id).await {
                count += 1;
            }
        }

        if count > 0 {
            tracing::info!(count = count, "Evicted idle upload batches");
        }

        count
    }
}

// ============================================================================
// Tests
// ============================================================================

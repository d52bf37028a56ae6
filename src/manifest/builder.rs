//! Manifest Builder
//!
//! Turns pending files plus device/network context into an `UploadManifest`.
//! The build is all-or-nothing: any unreadable or empty file fails the batch.

use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;

use super::types::{
    chunk_count, DeviceClass, FileManifestEntry, ManifestMetadata, NetworkClass, PendingFile,
    UploadManifest,
};
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, UploadError};
use crate::hashing::{digest_source, manifest_checksum};

/// Chunk size for fast / unmetered networks: 5MB
pub const FAST_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Chunk size for constrained / metered networks: 2MB
pub const CONSTRAINED_CHUNK_SIZE: u64 = 2 * 1024 * 1024;

/// Network-class chunk sizing policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSizePolicy {
    pub fast: u64,
    pub constrained: u64,
}

impl Default for ChunkSizePolicy {
    fn default() -> Self {
        Self {
            fast: FAST_CHUNK_SIZE,
            constrained: CONSTRAINED_CHUNK_SIZE,
        }
    }
}

impl ChunkSizePolicy {
    pub fn chunk_size_for(&self, network: NetworkClass) -> u64 {
        if network.is_fast() {
            self.fast
        } else {
            self.constrained
        }
    }
}

/// Builds upload manifests
#[derive(Clone)]
pub struct ManifestBuilder {
    policy: ChunkSizePolicy,
    client_version: String,
    clock: Arc<dyn Clock>,
}

impl ManifestBuilder {
    pub fn new(policy: ChunkSizePolicy, client_version: impl Into<String>) -> Self {
        Self {
            policy,
            client_version: client_version.into(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build a manifest for a batch of pending files
    pub async fn build(
        &self,
        upload_id: &str,
        principal_id: &str,
        files: &[PendingFile],
        device_class: DeviceClass,
        network_class: NetworkClass,
    ) -> Result<UploadManifest> {
        if files.is_empty() {
            return Err(UploadError::EmptyInput);
        }

        let chunk_size = self.policy.chunk_size_for(network_class);
        if chunk_size == 0 {
            return Err(UploadError::InvalidInput(
                "chunk size policy yields zero-byte chunks".to_string(),
            ));
        }

        let mut seen = HashSet::with_capacity(files.len());
        for file in files {
            if file.file_id.is_empty() {
                return Err(UploadError::InvalidInput("empty file id".to_string()));
            }
            if !seen.insert(file.file_id.as_str()) {
                return Err(UploadError::InvalidInput(format!(
                    "duplicate file id in batch: {}",
                    file.file_id
                )));
            }
        }

        let mut entries = Vec::with_capacity(files.len());
        for file in files {
            entries.push(self.build_entry(upload_id, file, chunk_size).await?);
        }

        let total_size: u64 = entries.iter().map(|e| e.size).sum();
        let checksum = manifest_checksum(entries.iter().map(|e| &e.checksum));

        let manifest = UploadManifest {
            manifest_id: Uuid::new_v4(),
            upload_id: upload_id.to_string(),
            principal_id: principal_id.to_string(),
            file_count: entries.len(),
            total_size,
            files: entries,
            metadata: ManifestMetadata {
                batch_size: files.len(),
                device_class,
                network_class,
                client_version: self.client_version.clone(),
                created_at: self.clock.now(),
            },
            manifest_checksum: checksum,
        };

        tracing::info!(
            upload_id = %upload_id,
            manifest_id = %manifest.manifest_id,
            files = manifest.file_count,
            total_size = manifest.total_size,
            chunk_size = chunk_size,
            chunks = manifest.total_chunks(),
            manifest_checksum = %manifest.manifest_checksum,
            "Built upload manifest"
        );

        Ok(manifest)
    }

    async fn build_entry(
        &self,
        upload_id: &str,
        file: &PendingFile,
        chunk_size: u64,
    ) -> Result<FileManifestEntry> {
        let (checksum, size) = digest_source(&file.file_id, &file.source).await?;

        if size == 0 {
            return Err(UploadError::InvalidInput(format!(
                "zero-byte file: {}",
                file.file_id
            )));
        }

        let file_name = if file.format.is_empty() {
            format!("{}_{}", upload_id, file.file_id)
        } else {
            format!("{}_{}.{}", upload_id, file.file_id, file.format)
        };

        tracing::debug!(
            file_id = %file.file_id,
            size = size,
            checksum = %checksum,
            "Hashed pending file"
        );

        Ok(FileManifestEntry {
            file_id: file.file_id.clone(),
            file_name,
            display_name: file.display_name.clone(),
            size,
            mime_type: file.mime_type(),
            checksum,
            chunk_count: chunk_count(size, chunk_size),
            chunk_size,
        })
    }
}

impl Default for ManifestBuilder {
    fn default() -> Self {
        Self::new(ChunkSizePolicy::default(), env!("CARGO_PKG_VERSION"))
    }
}

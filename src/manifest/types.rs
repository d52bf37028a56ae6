//! Manifest types

use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use uuid::Uuid;

use crate::hashing::Checksum;

// ============================================================================
// Classification
// ============================================================================

/// Class of the capturing device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Camera,
    Browser,
    Mobile,
    Desktop,
}

/// Network the device is uploading over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkClass {
    Wifi,
    Ethernet,
    Cellular,
    Metered,
    Unknown,
}

impl NetworkClass {
    /// Fast, unmetered links get the larger chunk size
    pub fn is_fast(self) -> bool {
        matches!(self, Self::Wifi | Self::Ethernet)
    }
}

// ============================================================================
// Pending Files
// ============================================================================

/// Where a pending file's bytes live
#[derive(Debug, Clone)]
pub enum FileSource {
    Path(PathBuf),
    Memory(Arc<[u8]>),
}

impl FileSource {
    /// Read exactly the bytes in `range`
    pub async fn read_range(&self, range: Range<u64>) -> io::Result<Vec<u8>> {
        let len = usize::try_from(range.end.saturating_sub(range.start))
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "range too large"))?;

        match self {
            Self::Path(path) => {
                let mut file = tokio::fs::File::open(path).await?;
                file.seek(io::SeekFrom::Start(range.start)).await?;
                let mut buf = vec![0u8; len];
                file.read_exact(&mut buf).await?;
                Ok(buf)
            }
            Self::Memory(bytes) => {
                let start = range.start as usize;
                bytes
                    .get(start..start + len)
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| {
                        io::Error::new(io::ErrorKind::UnexpectedEof, "range past end of buffer")
                    })
            }
        }
    }
}

/// One source file awaiting upload
#[derive(Debug, Clone)]
pub struct PendingFile {
    /// Caller-assigned identity, unique within a batch
    pub file_id: String,

    /// Name shown to the user
    pub display_name: String,

    /// Capture format as a file extension ("jpg", "dng", "mp4")
    pub format: String,

    pub source: FileSource,
}

impl PendingFile {
    /// A file on disk; name and format come from the path
    pub fn from_path(file_id: impl Into<String>, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let display_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let format = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();

        Self {
            file_id: file_id.into(),
            display_name,
            format,
            source: FileSource::Path(path.to_path_buf()),
        }
    }

    /// An in-memory capture
    pub fn from_bytes(
        file_id: impl Into<String>,
        display_name: impl Into<String>,
        format: impl Into<String>,
        bytes: impl Into<Arc<[u8]>>,
    ) -> Self {
        Self {
            file_id: file_id.into(),
            display_name: display_name.into(),
            format: format.into().to_ascii_lowercase(),
            source: FileSource::Memory(bytes.into()),
        }
    }

    /// MIME type derived from the capture format
    pub fn mime_type(&self) -> String {
        mime_guess::from_ext(&self.format)
            .first_or_octet_stream()
            .essence_str()
            .to_string()
    }
}

// ============================================================================
// Manifest Entries
// ============================================================================

/// Number of chunks for a file: `ceil(size / chunk_size)`
pub fn chunk_count(size: u64, chunk_size: u64) -> usize {
    if chunk_size == 0 {
        return 0;
    }
    size.div_ceil(chunk_size) as usize
}

/// Per-file metadata and chunk plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileManifestEntry {
    pub file_id: String,

    /// Stable storage name: `{uploadId}_{fileId}.{ext}`
    pub file_name: String,

    pub display_name: String,

    /// Size in bytes
    pub size: u64,

    pub mime_type: String,

    /// SHA-256 of the complete file
    pub checksum: Checksum,

    pub chunk_count: usize,

    pub chunk_size: u64,
}

impl FileManifestEntry {
    /// Plan using the manifest's own chunk size
    pub fn plan(&self) -> ChunkPlan {
        ChunkPlan::new(self.size, self.chunk_size)
    }
}

/// Byte layout of a file's chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub file_size: u64,
    pub chunk_size: u64,
    pub chunk_count: usize,
}

impl ChunkPlan {
    pub fn new(file_size: u64, chunk_size: u64) -> Self {
        Self {
            file_size,
            chunk_size,
            chunk_count: chunk_count(file_size, chunk_size),
        }
    }

    /// `[index * size, min((index + 1) * size, file_size))`
    pub fn range(&self, index: usize) -> Option<Range<u64>> {
        if index >= self.chunk_count {
            return None;
        }
        let start = index as u64 * self.chunk_size;
        let end = (start + self.chunk_size).min(self.file_size);
        Some(start..end)
    }
}

// ============================================================================
// Upload Manifest
// ============================================================================

/// Contextual metadata stamped at build time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestMetadata {
    pub batch_size: usize,
    pub device_class: DeviceClass,
    pub network_class: NetworkClass,
    pub client_version: String,
    pub created_at: DateTime<Utc>,
}

/// The unit of negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadManifest {
    pub manifest_id: Uuid,

    /// Upload batch this manifest describes
    pub upload_id: String,

    /// Uploading principal
    pub principal_id: String,

    pub file_count: usize,

    pub total_size: u64,

    /// Entries in input order
    pub files: Vec<FileManifestEntry>,

    pub metadata: ManifestMetadata,

    /// Order-independent aggregate over per-file digests (hint only)
    pub manifest_checksum: String,
}

impl UploadManifest {
    pub fn entry(&self, file_id: &str) -> Option<&FileManifestEntry> {
        self.files.iter().find(|e| e.file_id == file_id)
    }

    /// Batch-wide chunk size
    pub fn chunk_size(&self) -> u64 {
        self.files.first().map(|e| e.chunk_size).unwrap_or_default()
    }

    pub fn total_chunks(&self) -> usize {
        self.files.iter().map(|e| e.chunk_count).sum()
    }
}

//! Manifest Module
//!
//! Describes a batch of files before any bytes move:
//! - `PendingFile`: a caller-owned source awaiting upload
//! - `FileManifestEntry`: per-file digest and chunk plan
//! - `UploadManifest`: the unit of negotiation
//!
//! Chunk size is picked once per batch from the network class and never
//! changes for the life of the batch.

pub mod builder;
pub mod types;

pub use builder::{ChunkSizePolicy, ManifestBuilder, CONSTRAINED_CHUNK_SIZE, FAST_CHUNK_SIZE};
pub use types::*;

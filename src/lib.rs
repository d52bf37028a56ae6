//! Shutter Upload
//!
//! Chunked upload verification pipeline for capture devices. A batch of
//! photo/video assets moves through four phases:
//!
//! 1. Build a manifest (per-file digests and chunk plan)
//! 2. Negotiate a session with the upload authority
//! 3. Transfer checksummed chunks to pre-authorized destinations
//! 4. Ask the authority to verify received sizes and checksums
//!
//! # Modules
//!
//! - `hashing`: SHA-256 digests for files and chunks
//! - `manifest`: pending files, manifest entries and the manifest builder
//! - `session`: acknowledgment types and the session negotiator
//! - `transfer`: the chunked transfer engine
//! - `verification`: the verification client
//! - `orchestrator`: the phase state machine driving a whole batch
//! - `client`: HTTP implementations of the authority and destination
//! - `authority`: reference upload authority (in-process and axum server)

pub mod authority;
pub mod cancel;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod hashing;
pub mod manifest;
pub mod orchestrator;
pub mod progress;
pub mod retry;
pub mod session;
pub mod traits;
pub mod transfer;
pub mod verification;

pub use error::{Result, UploadError};
pub use manifest::{
    DeviceClass, FileManifestEntry, FileSource, ManifestBuilder, NetworkClass, PendingFile,
    UploadManifest,
};
pub use orchestrator::{UploadOrchestrator, UploadOutcome, UploadPhase, UploadRequest};
pub use session::{NegotiatedSession, SessionAcknowledgment, SessionNegotiator};
pub use transfer::{ChunkVerification, ChunkedTransferEngine};
pub use verification::{UploadVerificationResult, VerificationClient};

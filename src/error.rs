//! Error types for the upload pipeline

use axum::http::StatusCode;
use thiserror::Error;

use crate::verification::UploadVerificationResult;

/// Pipeline-wide result type
pub type Result<T> = std::result::Result<T, UploadError>;

/// Upload pipeline error type
#[derive(Debug, Error)]
pub enum UploadError {
    /// Source bytes unreadable while hashing or slicing
    #[error("Failed to read {file_id}: {source}")]
    Read {
        file_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Manifest requested with no files")]
    EmptyInput,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Session rejected by upload authority: {0}")]
    SessionRejected(String),

    #[error("Session expired: {0}")]
    SessionExpired(String),

    /// Acknowledgment violates the negotiation contract
    #[error("Invalid session acknowledgment: {0}")]
    InvalidAcknowledgment(String),

    #[error("Chunk {chunk_index} of {file_id} failed to transfer: {reason}")]
    ChunkTransfer {
        file_id: String,
        chunk_index: usize,
        reason: String,
    },

    #[error(
        "Verification mismatch: {}/{} files verified",
        .result.files_verified,
        .result.files_total
    )]
    VerificationMismatch { result: Box<UploadVerificationResult> },

    #[error("No upload destination for file: {0}")]
    DestinationNotFound(String),

    /// Transport or protocol failure talking to the upload authority
    #[error("Upload authority error: {0}")]
    Authority(String),

    #[error("Upload cancelled")]
    Cancelled,

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Chunk index out of bounds: {index} (chunks: {count})")]
    ChunkIndexOutOfBounds { index: usize, count: usize },

    #[error("Chunk checksum mismatch: expected {expected}, got {actual}")]
    ChunkChecksumMismatch { expected: String, actual: String },
}

impl UploadError {
    /// Whether the same call may be attempted again unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Authority(_) | Self::ChunkTransfer { .. })
    }

    /// Whether the error voids the current session
    pub fn requires_renegotiation(&self) -> bool {
        matches!(self, Self::SessionExpired(_))
    }

    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Read { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::EmptyInput => StatusCode::BAD_REQUEST,
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::SessionRejected(_) => StatusCode::CONFLICT,
            Self::SessionExpired(_) => StatusCode::GONE,
            Self::InvalidAcknowledgment(_) => StatusCode::BAD_GATEWAY,
            Self::ChunkTransfer { .. } => StatusCode::BAD_GATEWAY,
            Self::VerificationMismatch { .. } => StatusCode::CONFLICT,
            Self::DestinationNotFound(_) => StatusCode::NOT_FOUND,
            Self::Authority(_) => StatusCode::BAD_GATEWAY,
            Self::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::ChunkIndexOutOfBounds { .. } => StatusCode::BAD_REQUEST,
            Self::ChunkChecksumMismatch { .. } => StatusCode::CONFLICT,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Read { .. } => "READ_ERROR",
            Self::EmptyInput => "EMPTY_INPUT",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::SessionRejected(_) => "SESSION_REJECTED",
            Self::SessionExpired(_) => "SESSION_EXPIRED",
            Self::InvalidAcknowledgment(_) => "INVALID_ACKNOWLEDGMENT",
            Self::ChunkTransfer { .. } => "CHUNK_TRANSFER_FAILED",
            Self::VerificationMismatch { .. } => "VERIFICATION_MISMATCH",
            Self::DestinationNotFound(_) => "DESTINATION_NOT_FOUND",
            Self::Authority(_) => "AUTHORITY_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::ChunkIndexOutOfBounds { .. } => "CHUNK_INDEX_OUT_OF_BOUNDS",
            Self::ChunkChecksumMismatch { .. } => "CHUNK_CHECKSUM_MISMATCH",
        }
    }
}

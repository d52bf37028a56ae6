//! Upload Authority Routes
//!
//! HTTP endpoints for the reference upload authority.
//!
//! Endpoints:
//! - POST /api/v1/uploads/sessions - Submit a manifest
//! - PUT /api/v1/uploads/:upload_id/files/:file_id/chunks/:index - Deliver a chunk
//! - GET /api/v1/uploads/:upload_id/files/:file_id - Received size and checksum
//! - GET /health - Liveness

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use super::{ReferenceAuthority, API_PREFIX};
use crate::client::{CHUNK_CHECKSUM_HEADER, CHUNK_INDEX_HEADER, UPLOAD_SESSION_HEADER};
use crate::error::UploadError;
use crate::hashing::Checksum;
use crate::manifest::UploadManifest;
use crate::session::SessionAcknowledgment;
use crate::traits::{ChunkPayload, ReceivedFile};

/// Headroom over the chunk ceiling for the request body limit
const BODY_LIMIT_SLACK: usize = 64 * 1024;

// ============================================================================
// Error Response
// ============================================================================

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
        });

        (status, body).into_response()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Upload API, to be nested under `API_PREFIX`
pub fn router(authority: ReferenceAuthority) -> Router {
    let body_limit = usize::try_from(authority.settings().max_chunk_size)
        .unwrap_or(usize::MAX)
        .saturating_add(BODY_LIMIT_SLACK);

    Router::new()
        .route("/sessions", post(open_session))
        .route("/:upload_id/files/:file_id/chunks/:index", put(put_chunk))
        .route("/:upload_id/files/:file_id", get(file_status))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(authority)
}

/// Complete application: health check plus the upload API
pub fn app(authority: ReferenceAuthority) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/health", get(health_check))
        .nest(API_PREFIX, router(authority))
        .layer(TraceLayer::new_for_http())
}

// ============================================================================
// Handlers
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// POST /api/v1/uploads/sessions
///
/// Policy rejections are a successful response with `success: false`.
async fn open_session(
    State(authority): State<ReferenceAuthority>,
    Json(manifest): Json<UploadManifest>,
) -> Json<SessionAcknowledgment> {
    Json(authority.accept_manifest(&manifest).await)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChunkReceipt {
    chunk_index: usize,
    chunks_received: usize,
}

/// PUT /api/v1/uploads/:upload_id/files/:file_id/chunks/:index
///
/// The chunk is the raw request body.
async fn put_chunk(
    State(authority): State<ReferenceAuthority>,
    Path((upload_id, file_id, chunk_index)): Path<(String, String, usize)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ChunkReceipt>, UploadError> {
    let session_id = header_str(&headers, UPLOAD_SESSION_HEADER)
        .ok_or_else(|| UploadError::SessionNotFound(String::new()))?;

    let checksum = header_str(&headers, CHUNK_CHECKSUM_HEADER)
        .and_then(Checksum::from_hex)
        .ok_or_else(|| {
            UploadError::InvalidInput(format!("missing or malformed {}", CHUNK_CHECKSUM_HEADER))
        })?;

    if let Some(index) = header_str(&headers, CHUNK_INDEX_HEADER) {
        if index.parse::<usize>().ok() != Some(chunk_index) {
            return Err(UploadError::InvalidInput(format!(
                "{} {} disagrees with path index {}",
                CHUNK_INDEX_HEADER, index, chunk_index
            )));
        }
    }

    let chunks_received = authority
        .receive_chunk(ChunkPayload {
            upload_id: &upload_id,
            session_id,
            file_id: &file_id,
            chunk_index,
            checksum: &checksum,
            data: &body,
        })
        .await?;

    Ok(Json(ChunkReceipt {
        chunk_index,
        chunks_received,
    }))
}

/// GET /api/v1/uploads/:upload_id/files/:file_id
async fn file_status(
    State(authority): State<ReferenceAuthority>,
    Path((upload_id, file_id)): Path<(String, String)>,
) -> Result<Json<ReceivedFile>, UploadError> {
    authority
        .file_status(&upload_id, &file_id)
        .await
        .map(Json)
        .ok_or(UploadError::DestinationNotFound(file_id))
}

// ============================================================================
// Helpers
// ============================================================================

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

// ============================================================================
// Tests
// ============================================================================

//! Defines routes for the chunked-upload protocol.
//!
//! ## Structure
//! - `POST /upload/init`     — find-or-create / resume an upload
//! - `POST /upload/chunk`    — ingest one chunk (`upload-id`, `chunk-index` headers)
//! - `POST /upload/finalize` — promote, hash and complete
//! - `POST /upload/reset`    — discard an upload entirely
//! - `GET  /upload/{id}`     — record plus received indices
//! - `GET  /healthz`, `GET /readyz`

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        upload_handlers::{finalize_upload, get_upload, init_upload, reset_upload, upload_chunk},
    },
    services::upload_service::UploadService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Headroom over the chunk size for the chunk route body limit.
const BODY_SLACK: usize = 64 * 1024;

/// Build the router carrying `UploadService` as shared state.
///
/// `max_chunk_bytes` raises the body limit of the chunk route above axum's
/// 2 MB default.
pub fn routes(max_chunk_bytes: usize) -> Router<UploadService> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/upload/init", post(init_upload))
        .route(
            "/upload/chunk",
            post(upload_chunk).layer(DefaultBodyLimit::max(max_chunk_bytes.saturating_add(BODY_SLACK))),
        )
        .route("/upload/finalize", post(finalize_upload))
        .route("/upload/reset", post(reset_upload))
        .route("/upload/{id}", get(get_upload))
}

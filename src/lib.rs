//! Resumable, idempotent chunked uploads.
//!
//! The server half (`services`, `handlers`, `routes`) accepts fixed-size
//! chunks in any order, records which indices arrived and finalizes the
//! artifact exactly once. The client half (`client`) schedules transfers of
//! the missing chunks with bounded parallelism and resumes from server truth.

pub mod client;
pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod protocol;
pub mod routes;
pub mod services;

use axum::Router;
use services::upload_service::UploadService;

/// The complete HTTP application over `service`.
pub fn app(service: UploadService) -> Router {
    let max_chunk = usize::try_from(service.chunk_size).unwrap_or(usize::MAX);
    routes::routes::routes(max_chunk).with_state(service)
}

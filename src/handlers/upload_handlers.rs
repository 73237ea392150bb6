//! HTTP handlers for the chunked-upload protocol.
//! Each handler parses its request, delegates to `UploadService` and maps
//! service errors through `AppError`.

use crate::{
    errors::AppError,
    protocol::{
        CHUNK_INDEX_HEADER, ChunkAck, FinalizeResponse, InitRequest, InitResponse, ResetResponse,
        UPLOAD_ID_HEADER, UploadRef, UploadStatusResponse,
    },
    services::upload_service::UploadService,
};
use axum::{
    Json,
    body::Bytes,
    extract::{
        Path, State,
        rejection::{JsonRejection, PathRejection},
    },
    http::HeaderMap,
};
use std::str::FromStr;
use uuid::Uuid;

/// `POST /upload/init`
pub async fn init_upload(
    State(service): State<UploadService>,
    payload: Result<Json<InitRequest>, JsonRejection>,
) -> Result<Json<InitResponse>, AppError> {
    let Json(req) = payload?;
    let resp = service.init(&req).await?;
    tracing::info!(
        upload_id = %resp.upload_id,
        status = %resp.status,
        received = resp.received_indices.len(),
        "upload initialized"
    );
    Ok(Json(resp))
}

/// `POST /upload/chunk`
///
/// The raw body is the chunk payload; `upload-id` and `chunk-index` headers
/// address it.
pub async fn upload_chunk(
    State(service): State<UploadService>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ChunkAck>, AppError> {
    let upload_id: Uuid = required_header(&headers, UPLOAD_ID_HEADER)?;
    let chunk_index: u64 = required_header(&headers, CHUNK_INDEX_HEADER)?;

    let ack = service.ingest(upload_id, chunk_index, body).await?;
    Ok(Json(ack))
}

/// `POST /upload/finalize`
pub async fn finalize_upload(
    State(service): State<UploadService>,
    payload: Result<Json<UploadRef>, JsonRejection>,
) -> Result<Json<FinalizeResponse>, AppError> {
    let Json(req) = payload?;
    let outcome = service.finalize(req.upload_id).await?;
    tracing::info!(
        upload_id = %req.upload_id,
        hash = %outcome.hash,
        already_completed = outcome.already_completed,
        "upload finalized"
    );
    Ok(Json(FinalizeResponse {
        hash: outcome.hash,
        entry_names: outcome.entry_names,
        already_completed: outcome.already_completed,
    }))
}

/// `POST /upload/reset`
pub async fn reset_upload(
    State(service): State<UploadService>,
    payload: Result<Json<UploadRef>, JsonRejection>,
) -> Result<Json<ResetResponse>, AppError> {
    let Json(req) = payload?;
    service.reset(req.upload_id).await?;
    Ok(Json(ResetResponse { ok: true }))
}

/// `GET /upload/{id}`
pub async fn get_upload(
    State(service): State<UploadService>,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<UploadStatusResponse>, AppError> {
    let Path(id) = path?;
    let (upload, received_indices) = service.status(id).await?;
    Ok(Json(UploadStatusResponse {
        upload,
        received_indices,
    }))
}

fn required_header<T: FromStr>(headers: &HeaderMap, name: &str) -> Result<T, AppError> {
    let raw = headers
        .get(name)
        .ok_or_else(|| AppError::bad_request(format!("missing `{}` header", name)))?;
    raw.to_str()
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .ok_or_else(|| AppError::bad_request(format!("invalid `{}` header", name)))
}

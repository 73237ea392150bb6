//! Wire types shared by the HTTP handlers and the upload client.
//!
//! All bodies are JSON with camelCase field names.

use crate::models::upload::{Upload, UploadStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Header carrying the target upload id on `POST /upload/chunk`.
pub const UPLOAD_ID_HEADER: &str = "upload-id";
/// Header carrying the chunk index on `POST /upload/chunk`.
pub const CHUNK_INDEX_HEADER: &str = "chunk-index";

/// Machine-readable error codes carried in [`ErrorBody::code`].
pub mod codes {
    pub const NOT_FOUND: &str = "not_found";
    pub const INVALID_REQUEST: &str = "invalid_request";
    pub const INVALID_STATE: &str = "invalid_state";
    pub const FINGERPRINT_MISMATCH: &str = "fingerprint_mismatch";
    pub const INCOMPLETE: &str = "incomplete";
    pub const FINALIZE_IN_PROGRESS: &str = "finalize_in_progress";
    pub const STALE: &str = "stale";
    pub const IO_FAILURE: &str = "io_failure";
    pub const INTERNAL: &str = "internal";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub total_chunks: u64,
    #[serde(default)]
    pub upload_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitResponse {
    pub status: UploadStatus,
    pub upload_id: Uuid,
    pub received_indices: Vec<u64>,
    pub chunk_size: u64,
    pub total_chunks: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    pub status: String,
    pub chunk_index: u64,
    /// Hex MD5 of the chunk payload as received.
    pub etag: String,
}

/// Body of both `finalize` and `reset`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRef {
    pub upload_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeResponse {
    pub hash: String,
    pub entry_names: Vec<String>,
    pub already_completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetResponse {
    pub ok: bool,
}

/// `GET /upload/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatusResponse {
    #[serde(flatten)]
    pub upload: Upload,
    pub received_indices: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
    pub status: u16,
}

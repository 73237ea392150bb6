use crate::models::upload::UploadStatus;
use std::io;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload `{0}` not found")]
    NotFound(Uuid),
    #[error("upload `{id}` is {actual}, operation requires {required}")]
    InvalidState {
        id: Uuid,
        actual: UploadStatus,
        required: UploadStatus,
    },
    #[error("upload `{id}` is incomplete: {received} of {total} chunks received")]
    Incomplete { id: Uuid, received: u64, total: u64 },
    #[error("upload `{id}` no longer accepts chunks (status {status})")]
    Stale { id: Uuid, status: UploadStatus },
    #[error("finalize of upload `{0}` is already in progress")]
    InProgress(Uuid),
    #[error("fingerprint does not match upload `{0}`")]
    FingerprintMismatch(Uuid),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;

impl UploadError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }
}

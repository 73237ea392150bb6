use crate::{
    protocol::{ErrorBody, codes},
    services::error::UploadError,
};
use axum::{
    Json,
    extract::rejection::{JsonRejection, PathRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::fmt;

/// A lightweight wrapper for handler errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status, code and message.
    pub fn new(status: StatusCode, code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: msg.into(),
        }
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::INVALID_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            code: self.code.to_string(),
            status: self.status.as_u16(),
        });

        (self.status, body).into_response()
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        let (status, code) = match &err {
            UploadError::NotFound(_) => (StatusCode::NOT_FOUND, codes::NOT_FOUND),
            UploadError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, codes::INVALID_REQUEST),
            UploadError::InvalidState { .. } => (StatusCode::CONFLICT, codes::INVALID_STATE),
            UploadError::FingerprintMismatch(_) => {
                (StatusCode::CONFLICT, codes::FINGERPRINT_MISMATCH)
            }
            UploadError::Incomplete { .. } => (StatusCode::CONFLICT, codes::INCOMPLETE),
            UploadError::InProgress(_) => (StatusCode::CONFLICT, codes::FINALIZE_IN_PROGRESS),
            UploadError::Stale { .. } => (StatusCode::GONE, codes::STALE),
            UploadError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, codes::IO_FAILURE),
            UploadError::Sqlx(_) => (StatusCode::INTERNAL_SERVER_ERROR, codes::INTERNAL),
        };
        if status.is_server_error() {
            tracing::error!("request failed: {}", err);
        }
        AppError::new(status, code, err.to_string())
    }
}

// Extractor failures keep the JSON error shape instead of axum's plain text.
impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::bad_request(rejection.body_text())
    }
}

impl From<PathRejection> for AppError {
    fn from(rejection: PathRejection) -> Self {
        AppError::bad_request(rejection.body_text())
    }
}

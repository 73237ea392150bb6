use crate::protocol::{ErrorBody, codes};
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("upload not found on server: {0}")]
    NotFound(String),
    #[error("upload no longer accepts chunks: {0}")]
    Stale(String),
    #[error("server reports missing chunks: {0}")]
    Incomplete(String),
    #[error("finalize already in progress on server")]
    FinalizeInProgress,
    #[error("server rejected request ({status} {code}): {message}")]
    Rejected {
        status: u16,
        code: String,
        message: String,
    },
    #[error("chunk {index} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        index: u64,
        attempts: u32,
        last: String,
    },
    #[error("unexpected server response: {0}")]
    Protocol(String),
    #[error("transfer cancelled")]
    Cancelled,
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("local state: {0}")]
    State(#[from] serde_json::Error),
}

pub type TransferResult<T> = Result<T, TransferError>;

impl TransferError {
    /// Classify a non-2xx response by its error code.
    pub fn from_body(body: ErrorBody) -> Self {
        match body.code.as_str() {
            codes::NOT_FOUND => TransferError::NotFound(body.error),
            codes::STALE => TransferError::Stale(body.error),
            codes::INCOMPLETE => TransferError::Incomplete(body.error),
            codes::FINALIZE_IN_PROGRESS => TransferError::FinalizeInProgress,
            _ => TransferError::Rejected {
                status: body.status,
                code: body.code,
                message: body.error,
            },
        }
    }

    /// Whether repeating the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Transport(_) | TransferError::FinalizeInProgress => true,
            TransferError::Rejected { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(code: &str, status: u16) -> ErrorBody {
        ErrorBody {
            error: "boom".into(),
            code: code.into(),
            status,
        }
    }

    #[test]
    fn codes_map_to_variants() {
        assert!(matches!(
            TransferError::from_body(body(codes::STALE, 410)),
            TransferError::Stale(_)
        ));
        assert!(matches!(
            TransferError::from_body(body(codes::FINALIZE_IN_PROGRESS, 409)),
            TransferError::FinalizeInProgress
        ));
    }

    #[test]
    fn only_server_faults_are_retried() {
        assert!(TransferError::from_body(body(codes::IO_FAILURE, 500)).is_retryable());
        assert!(!TransferError::from_body(body(codes::INVALID_REQUEST, 400)).is_retryable());
        assert!(!TransferError::from_body(body(codes::STALE, 410)).is_retryable());
        assert!(!TransferError::NotFound("gone".into()).is_retryable());
    }
}

//! Represents one logical upload tracked by the registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

use super::chunk::ChunkLayout;

/// Lifecycle of an upload.
///
/// `RECEIVING -> FINALIZING -> COMPLETED`, with `FINALIZING -> ERROR` on a
/// failed promotion or hash and `ERROR -> FINALIZING` when finalize is retried.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadStatus {
    Receiving,
    Finalizing,
    Completed,
    Error,
}

impl UploadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Receiving => "RECEIVING",
            UploadStatus::Finalizing => "FINALIZING",
            UploadStatus::Completed => "COMPLETED",
            UploadStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity and shape of one logical transfer.
///
/// The record stores metadata only; the bytes live in the partial or
/// permanent artifact addressed by `id`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Upload {
    /// Registry-assigned identifier.
    pub id: Uuid,

    /// Client-computed identity of the logical file.
    pub fingerprint: String,

    /// Declared name of the file being uploaded.
    pub filename: String,

    /// Declared size in bytes.
    pub total_size: i64,

    /// Chunk size in force when the record was created.
    pub chunk_size: i64,

    /// `ceil(total_size / chunk_size)`.
    pub total_chunks: i64,

    /// Current state-machine position.
    pub status: UploadStatus,

    /// Lowercase hex SHA-256 of the finalized artifact; set iff `COMPLETED`.
    pub final_hash: Option<String>,

    /// When the record was first created.
    pub created_at: DateTime<Utc>,

    /// When the status last changed.
    pub updated_at: DateTime<Utc>,
}

impl Upload {
    pub fn layout(&self) -> ChunkLayout {
        ChunkLayout::new(self.total_size as u64, self.chunk_size as u64)
    }
}

//! Upload registry: per-upload records and their state machine.
//!
//! `transition` is a compare-and-swap on `status` and is the only
//! serialization point between concurrent finalize attempts.

use crate::{
    models::{chunk::ChunkLayout, upload::Upload, upload::UploadStatus},
    services::{
        error::{UploadError, UploadResult},
        layout::ArtifactLayout,
    },
};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const UPLOAD_COLUMNS: &str = "id, fingerprint, filename, total_size, chunk_size, total_chunks, \
                              status, final_hash, created_at, updated_at";

/// Shape of an upload declared by the client on first contact.
#[derive(Clone, Debug)]
pub struct NewUpload<'a> {
    pub fingerprint: &'a str,
    pub filename: &'a str,
    pub total_size: u64,
    pub chunk_size: u64,
}

#[derive(Clone)]
pub struct UploadRegistry {
    db: Arc<SqlitePool>,
    layout: ArtifactLayout,
}

impl UploadRegistry {
    pub fn new(db: Arc<SqlitePool>, layout: ArtifactLayout) -> Self {
        Self { db, layout }
    }

    /// Return the upload registered under `new.fingerprint`, creating it in
    /// `RECEIVING` when absent.
    ///
    /// A `COMPLETED` record whose artifact vanished from disk is demoted so
    /// the client can supply the chunks again.
    pub async fn find_or_create(&self, new: NewUpload<'_>) -> UploadResult<Upload> {
        if new.fingerprint.is_empty() {
            return Err(UploadError::invalid("fingerprint must not be empty"));
        }
        let layout = ChunkLayout::new(new.total_size, new.chunk_size);
        let now = Utc::now();

        let inserted = sqlx::query(
            "INSERT INTO uploads (
                id, fingerprint, filename, total_size, chunk_size, total_chunks,
                status, final_hash, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, NULL, ?, ?)
             ON CONFLICT(fingerprint) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(new.fingerprint)
        .bind(new.filename)
        .bind(new.total_size as i64)
        .bind(layout.chunk_size as i64)
        .bind(layout.total_chunks() as i64)
        .bind(UploadStatus::Receiving)
        .bind(now)
        .bind(now)
        .execute(&*self.db)
        .await?;

        let upload = sqlx::query_as::<_, Upload>(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM uploads WHERE fingerprint = ?"
        ))
        .bind(new.fingerprint)
        .fetch_one(&*self.db)
        .await?;

        if inserted.rows_affected() == 1 {
            info!(upload_id = %upload.id, fingerprint = new.fingerprint, total_chunks = upload.total_chunks, "upload created");
            return Ok(upload);
        }

        if upload.total_size != new.total_size as i64 {
            return Err(UploadError::invalid(format!(
                "upload `{}` was declared with {} bytes, not {}",
                upload.id, upload.total_size, new.total_size
            )));
        }

        self.reconcile_dangling(upload).await
    }

    /// Id-based resume: the id must name a real record.
    pub async fn reopen(&self, id: Uuid) -> UploadResult<Upload> {
        let upload = self.lookup(id).await?;
        self.reconcile_dangling(upload).await
    }

    pub async fn lookup(&self, id: Uuid) -> UploadResult<Upload> {
        sqlx::query_as::<_, Upload>(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM uploads WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(UploadError::NotFound(id))
    }

    /// Compare-and-swap `status` from `from` to `to`.
    ///
    /// Returns false, changing nothing, when the current status is not `from`.
    pub async fn transition(
        &self,
        id: Uuid,
        from: UploadStatus,
        to: UploadStatus,
    ) -> UploadResult<bool> {
        let result = sqlx::query(
            "UPDATE uploads SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(to)
        .bind(Utc::now())
        .bind(id)
        .bind(from)
        .execute(&*self.db)
        .await?;

        let swapped = result.rows_affected() == 1;
        if swapped {
            info!(upload_id = %id, %from, %to, "upload status changed");
        }
        Ok(swapped)
    }

    /// `FINALIZING -> COMPLETED`, storing the hash in the same statement.
    pub async fn complete(&self, id: Uuid, final_hash: &str) -> UploadResult<bool> {
        let result = sqlx::query(
            "UPDATE uploads SET status = ?, final_hash = ?, updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(UploadStatus::Completed)
        .bind(final_hash)
        .bind(Utc::now())
        .bind(id)
        .bind(UploadStatus::Finalizing)
        .execute(&*self.db)
        .await?;

        let swapped = result.rows_affected() == 1;
        if swapped {
            info!(upload_id = %id, final_hash, "upload completed");
        }
        Ok(swapped)
    }

    /// Delete the record and its chunk facts if it is still in `status`.
    pub async fn delete_if(&self, id: Uuid, status: UploadStatus) -> UploadResult<bool> {
        self.delete_where(id, "status = ?", status).await
    }

    /// Delete the record and its chunk facts unless it is in `status`.
    pub async fn delete_unless(&self, id: Uuid, status: UploadStatus) -> UploadResult<bool> {
        self.delete_where(id, "status <> ?", status).await
    }

    async fn delete_where(&self, id: Uuid, predicate: &str, status: UploadStatus) -> UploadResult<bool> {
        let mut tx = self.db.begin().await?;
        let result = sqlx::query(&format!("DELETE FROM uploads WHERE id = ? AND {predicate}"))
            .bind(id)
            .bind(status)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }
        sqlx::query("DELETE FROM chunks WHERE upload_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Uploads still `RECEIVING` that were created before `cutoff`.
    pub async fn stale_receiving(&self, cutoff: DateTime<Utc>) -> UploadResult<Vec<Upload>> {
        self.by_status_before(UploadStatus::Receiving, "created_at", cutoff)
            .await
    }

    /// Uploads that entered `FINALIZING` before `cutoff` and never left it.
    pub async fn stuck_finalizing(&self, cutoff: DateTime<Utc>) -> UploadResult<Vec<Upload>> {
        self.by_status_before(UploadStatus::Finalizing, "updated_at", cutoff)
            .await
    }

    async fn by_status_before(
        &self,
        status: UploadStatus,
        column: &str,
        cutoff: DateTime<Utc>,
    ) -> UploadResult<Vec<Upload>> {
        let rows = sqlx::query_as::<_, Upload>(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM uploads WHERE status = ? AND {column} < ?
             ORDER BY {column} ASC"
        ))
        .bind(status)
        .bind(cutoff)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    /// Demote a `COMPLETED` upload whose permanent artifact is missing.
    ///
    /// Its chunk facts describe bytes that no longer exist, so they are
    /// dropped together with the hash.
    async fn reconcile_dangling(&self, upload: Upload) -> UploadResult<Upload> {
        if upload.status != UploadStatus::Completed || self.layout.is_promoted(upload.id).await? {
            return Ok(upload);
        }

        warn!(upload_id = %upload.id, "completed upload has no artifact on disk, demoting");

        let mut tx = self.db.begin().await?;
        let demoted = sqlx::query(
            "UPDATE uploads SET status = ?, final_hash = NULL, updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(UploadStatus::Receiving)
        .bind(Utc::now())
        .bind(upload.id)
        .bind(UploadStatus::Completed)
        .execute(&mut *tx)
        .await?;
        if demoted.rows_affected() == 1 {
            sqlx::query("DELETE FROM chunks WHERE upload_id = ?")
                .bind(upload.id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        ArtifactLayout::remove_if_exists(&self.layout.partial_path(upload.id)).await?;
        self.lookup(upload.id).await
    }
}

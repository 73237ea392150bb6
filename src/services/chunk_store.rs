//! Chunk store: idempotent chunk ingestion into a pre-sized partial artifact.
//!
//! Every chunk index maps to a fixed byte range, so concurrent requests for
//! different indices never overlap and arrival order does not matter.

use crate::{
    models::upload::{Upload, UploadStatus},
    protocol::ChunkAck,
    services::{
        error::{UploadError, UploadResult},
        layout::ArtifactLayout,
        registry::UploadRegistry,
    },
};
use bytes::Bytes;
use chrono::Utc;
use sqlx::SqlitePool;
use std::{
    io::{self, SeekFrom},
    path::Path,
    sync::Arc,
};
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncSeekExt, AsyncWriteExt},
    sync::{RwLock, RwLockWriteGuard},
};
use tracing::{debug, warn};
use uuid::Uuid;

const WRITE_GATE_STRIPES: usize = 64;

#[derive(Clone)]
pub struct ChunkStore {
    db: Arc<SqlitePool>,
    registry: UploadRegistry,
    layout: ArtifactLayout,
    // Chunk writes hold a stripe shared; promotion and discard hold it
    // exclusively, so no write lands in a file after it was renamed or removed.
    gates: Arc<[RwLock<()>]>,
}

impl ChunkStore {
    pub fn new(db: Arc<SqlitePool>, registry: UploadRegistry, layout: ArtifactLayout) -> Self {
        Self {
            db,
            registry,
            layout,
            gates: (0..WRITE_GATE_STRIPES).map(|_| RwLock::new(())).collect(),
        }
    }

    fn gate(&self, upload_id: Uuid) -> &RwLock<()> {
        &self.gates[(upload_id.as_u128() % WRITE_GATE_STRIPES as u128) as usize]
    }

    /// Wait for in-flight chunk writes on `upload_id` and hold off new ones
    /// until the guard drops.
    pub async fn seal(&self, upload_id: Uuid) -> RwLockWriteGuard<'_, ()> {
        self.gate(upload_id).write().await
    }

    /// Write `bytes` at the fixed offset of `chunk_index` and record the fact.
    ///
    /// Re-ingesting an index is accepted; the last write at that offset wins.
    /// The fact is only recorded while the upload is still `RECEIVING`, so a
    /// chunk racing a finalize comes back as [`UploadError::Stale`].
    pub async fn ingest(
        &self,
        upload_id: Uuid,
        chunk_index: u64,
        bytes: Bytes,
    ) -> UploadResult<ChunkAck> {
        let upload = self.registry.lookup(upload_id).await?;
        if upload.status != UploadStatus::Receiving {
            return Err(UploadError::Stale {
                id: upload_id,
                status: upload.status,
            });
        }

        let layout = upload.layout();
        let expected = layout.expected_len(chunk_index).ok_or_else(|| {
            UploadError::invalid(format!(
                "chunk index {} out of range, upload has {} chunks",
                chunk_index, upload.total_chunks
            ))
        })?;
        if bytes.len() as u64 != expected {
            return Err(UploadError::invalid(format!(
                "chunk {} must be {} bytes, got {}",
                chunk_index,
                expected,
                bytes.len()
            )));
        }

        let _gate = self.gate(upload_id).read().await;
        let partial = self.layout.partial_path(upload_id);
        write_at(&partial, layout.offset(chunk_index), layout.total_size, &bytes).await?;

        let recorded = sqlx::query(
            "INSERT INTO chunks (upload_id, chunk_index, received_at)
             SELECT ?, ?, ? WHERE EXISTS (SELECT 1 FROM uploads WHERE id = ? AND status = ?)
             ON CONFLICT(upload_id, chunk_index) DO NOTHING",
        )
        .bind(upload_id)
        .bind(chunk_index as i64)
        .bind(Utc::now())
        .bind(upload_id)
        .bind(UploadStatus::Receiving)
        .execute(&*self.db)
        .await?;

        if recorded.rows_affected() == 0 {
            // Either a duplicate, or the upload moved on while we were writing.
            let current = match self.registry.lookup(upload_id).await {
                Ok(current) => current,
                Err(UploadError::NotFound(_)) => {
                    // Reset or swept mid-write: nothing owns the file any more.
                    if let Err(err) = ArtifactLayout::remove_if_exists(&partial).await {
                        warn!(%upload_id, "failed to remove orphaned partial artifact: {}", err);
                    }
                    return Err(UploadError::NotFound(upload_id));
                }
                Err(err) => return Err(err),
            };
            if current.status != UploadStatus::Receiving {
                self.drop_stray_partial(upload_id).await;
                return Err(UploadError::Stale {
                    id: upload_id,
                    status: current.status,
                });
            }
            debug!(%upload_id, chunk_index, "duplicate chunk rewritten");
        } else {
            debug!(%upload_id, chunk_index, len = bytes.len(), "chunk recorded");
        }

        Ok(ChunkAck {
            status: "ok".into(),
            chunk_index,
            etag: format!("{:x}", md5::compute(&bytes)),
        })
    }

    /// Sorted distinct chunk indices received for `upload_id`.
    pub async fn received_indices(&self, upload_id: Uuid) -> UploadResult<Vec<u64>> {
        let rows = sqlx::query_scalar::<_, i64>(
            "SELECT chunk_index FROM chunks WHERE upload_id = ? ORDER BY chunk_index ASC",
        )
        .bind(upload_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows.into_iter().map(|i| i as u64).collect())
    }

    pub async fn received_count(&self, upload_id: Uuid) -> UploadResult<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(DISTINCT chunk_index) FROM chunks WHERE upload_id = ?",
        )
        .bind(upload_id)
        .fetch_one(&*self.db)
        .await?;
        Ok(count as u64)
    }

    pub async fn is_complete(&self, upload: &Upload) -> UploadResult<bool> {
        Ok(self.received_count(upload.id).await? == upload.total_chunks as u64)
    }

    /// Remove the partial and promoted artifacts of `upload_id`, if any.
    pub async fn discard(&self, upload_id: Uuid) -> io::Result<()> {
        let _sealed = self.seal(upload_id).await;
        ArtifactLayout::remove_if_exists(&self.layout.partial_path(upload_id)).await?;
        ArtifactLayout::remove_if_exists(&self.layout.final_path(upload_id)).await?;
        Ok(())
    }

    /// A late chunk may recreate the partial file after promotion renamed it.
    async fn drop_stray_partial(&self, upload_id: Uuid) {
        match self.layout.is_promoted(upload_id).await {
            Ok(true) => {
                if let Err(err) =
                    ArtifactLayout::remove_if_exists(&self.layout.partial_path(upload_id)).await
                {
                    warn!(%upload_id, "failed to remove stray partial artifact: {}", err);
                }
            }
            Ok(false) => {}
            Err(err) => warn!(%upload_id, "failed to check promoted artifact: {}", err),
        }
    }
}

/// Write `bytes` at `offset`, creating and pre-sizing the file on first use.
///
/// Opening without truncation and only ever growing the length keeps two
/// racing first writes from clobbering each other.
async fn write_at(path: &Path, offset: u64, total_size: u64, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await?;
    if file.metadata().await?.len() < total_size {
        file.set_len(total_size).await?;
    }
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_data().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{registry::NewUpload, test_support::TestEnv};

    async fn ten_byte_upload(env: &TestEnv, fingerprint: &str) -> Upload {
        env.registry
            .find_or_create(NewUpload {
                fingerprint,
                filename: "letters.bin",
                total_size: 10,
                chunk_size: 4,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn chunk_written_after_reset_leaves_no_orphan() {
        let env = TestEnv::new().await;
        let upload = ten_byte_upload(&env, "reset-race").await;

        // Park an ingest at the write gate, then remove the record under it.
        let sealed = env.chunks.seal(upload.id).await;
        let chunks = env.chunks.clone();
        let id = upload.id;
        let pending =
            tokio::spawn(async move { chunks.ingest(id, 0, Bytes::from_static(b"ABCD")).await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(
            env.registry
                .delete_unless(upload.id, UploadStatus::Finalizing)
                .await
                .unwrap()
        );
        drop(sealed);

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, UploadError::NotFound(_)), "{err:?}");
        assert!(!env.layout.partial_path(upload.id).exists());
    }

    #[tokio::test]
    async fn chunk_racing_promotion_never_writes_into_the_artifact() {
        let env = TestEnv::new().await;
        let upload = ten_byte_upload(&env, "promote-race").await;
        for (index, bytes) in [(0, &b"ABCD"[..]), (1, b"EFGH"), (2, b"IJ")] {
            env.chunks
                .ingest(upload.id, index, Bytes::copy_from_slice(bytes))
                .await
                .unwrap();
        }

        // A resend of chunk 0 passes its status check, then waits at the gate
        // while a finalize claims the upload and queues up behind it.
        let sealed = env.chunks.seal(upload.id).await;
        let chunks = env.chunks.clone();
        let id = upload.id;
        let resend =
            tokio::spawn(async move { chunks.ingest(id, 0, Bytes::from_static(b"WXYZ")).await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let finalizer = env.finalizer.clone();
        let finalize = tokio::spawn(async move { finalizer.finalize(id).await });
        for _ in 0..500 {
            if env.registry.lookup(id).await.unwrap().status == UploadStatus::Finalizing {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        drop(sealed);

        let outcome = finalize.await.unwrap().unwrap();
        let resent = resend.await.unwrap();
        assert!(matches!(resent, Err(UploadError::Stale { .. })), "{resent:?}");

        let final_path = env.layout.final_path(upload.id);
        let on_disk = crate::services::finalizer::sha256_file(&final_path).await.unwrap();
        assert_eq!(outcome.hash, on_disk);
        assert!(!env.layout.partial_path(upload.id).exists());
    }

    #[tokio::test]
    async fn reverse_order_reconstructs_by_offset() {
        let env = TestEnv::new().await;
        let upload = ten_byte_upload(&env, "letters").await;

        env.chunks.ingest(upload.id, 2, Bytes::from_static(b"IJ")).await.unwrap();
        env.chunks.ingest(upload.id, 1, Bytes::from_static(b"EFGH")).await.unwrap();
        env.chunks.ingest(upload.id, 0, Bytes::from_static(b"ABCD")).await.unwrap();

        let content = tokio::fs::read(env.layout.partial_path(upload.id)).await.unwrap();
        assert_eq!(content, b"ABCDEFGHIJ");
    }

    #[tokio::test]
    async fn duplicate_ingest_is_idempotent() {
        let env = TestEnv::new().await;
        let upload = ten_byte_upload(&env, "dup").await;

        let first = env.chunks.ingest(upload.id, 1, Bytes::from_static(b"EFGH")).await.unwrap();
        let before = tokio::fs::read(env.layout.partial_path(upload.id)).await.unwrap();
        let second = env.chunks.ingest(upload.id, 1, Bytes::from_static(b"EFGH")).await.unwrap();
        let after = tokio::fs::read(env.layout.partial_path(upload.id)).await.unwrap();

        assert_eq!(first.etag, second.etag);
        assert_eq!(before, after);
        assert_eq!(env.chunks.received_indices(upload.id).await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn completion_gate_is_order_independent() {
        let env = TestEnv::new().await;
        let upload = ten_byte_upload(&env, "gate").await;

        assert!(!env.chunks.is_complete(&upload).await.unwrap());
        env.chunks.ingest(upload.id, 2, Bytes::from_static(b"IJ")).await.unwrap();
        env.chunks.ingest(upload.id, 0, Bytes::from_static(b"ABCD")).await.unwrap();
        env.chunks.ingest(upload.id, 0, Bytes::from_static(b"ABCD")).await.unwrap();
        assert!(!env.chunks.is_complete(&upload).await.unwrap());
        env.chunks.ingest(upload.id, 1, Bytes::from_static(b"EFGH")).await.unwrap();
        assert!(env.chunks.is_complete(&upload).await.unwrap());
    }

    #[tokio::test]
    async fn out_of_range_and_wrong_length_are_rejected() {
        let env = TestEnv::new().await;
        let upload = ten_byte_upload(&env, "bounds").await;

        let err = env
            .chunks
            .ingest(upload.id, 3, Bytes::from_static(b"XY"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::InvalidRequest(_)));

        let err = env
            .chunks
            .ingest(upload.id, 0, Bytes::from_static(b"ABC"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::InvalidRequest(_)));
        assert!(env.chunks.received_indices(upload.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_upload_is_not_found() {
        let env = TestEnv::new().await;
        let err = env
            .chunks
            .ingest(Uuid::new_v4(), 0, Bytes::from_static(b"ABCD"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::NotFound(_)));
    }

    #[tokio::test]
    async fn ingest_after_finalize_is_stale() {
        let env = TestEnv::new().await;
        let upload = ten_byte_upload(&env, "stale").await;
        env.registry
            .transition(upload.id, UploadStatus::Receiving, UploadStatus::Finalizing)
            .await
            .unwrap();

        let err = env
            .chunks
            .ingest(upload.id, 0, Bytes::from_static(b"ABCD"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::Stale {
                status: UploadStatus::Finalizing,
                ..
            }
        ));
        assert!(env.chunks.received_indices(upload.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_first_chunks_share_one_partial() {
        let env = TestEnv::new().await;
        let upload = ten_byte_upload(&env, "race").await;

        let a = env.chunks.clone();
        let b = env.chunks.clone();
        let (ra, rb) = tokio::join!(
            a.ingest(upload.id, 0, Bytes::from_static(b"ABCD")),
            b.ingest(upload.id, 1, Bytes::from_static(b"EFGH")),
        );
        ra.unwrap();
        rb.unwrap();
        env.chunks.ingest(upload.id, 2, Bytes::from_static(b"IJ")).await.unwrap();

        let content = tokio::fs::read(env.layout.partial_path(upload.id)).await.unwrap();
        assert_eq!(content, b"ABCDEFGHIJ");
    }

    #[tokio::test]
    async fn discard_removes_both_artifacts() {
        let env = TestEnv::new().await;
        let upload = ten_byte_upload(&env, "discard").await;
        env.chunks.ingest(upload.id, 0, Bytes::from_static(b"ABCD")).await.unwrap();
        env.layout.ensure_dirs().await.unwrap();
        tokio::fs::write(env.layout.final_path(upload.id), b"x").await.unwrap();

        env.chunks.discard(upload.id).await.unwrap();
        env.chunks.discard(upload.id).await.unwrap();
        assert!(!env.layout.partial_path(upload.id).exists());
        assert!(!env.layout.final_path(upload.id).exists());
    }
}

//! UploadService — the shared state behind every HTTP handler.
//!
//! Bundles the registry, chunk store and finalizer over one SQLite pool and
//! one storage root, and implements the `init`/`reset` flows that span them.

use crate::{
    models::{chunk::ChunkLayout, upload::Upload, upload::UploadStatus},
    protocol::{ChunkAck, InitRequest, InitResponse},
    services::{
        chunk_store::ChunkStore,
        error::{UploadError, UploadResult},
        finalizer::{FinalizeOutcome, Finalizer},
        layout::ArtifactLayout,
        registry::{NewUpload, UploadRegistry},
        sweeper::Sweeper,
    },
};
use bytes::Bytes;
use sqlx::SqlitePool;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::info;
use uuid::Uuid;

#[derive(Clone)]
pub struct UploadService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Where partial and promoted artifacts live.
    pub layout: ArtifactLayout,

    /// Chunk size assigned to newly created uploads.
    pub chunk_size: u64,

    registry: UploadRegistry,
    chunks: ChunkStore,
    finalizer: Finalizer,
}

impl UploadService {
    pub fn new(db: Arc<SqlitePool>, storage_dir: impl Into<PathBuf>, chunk_size: u64) -> Self {
        let layout = ArtifactLayout::new(storage_dir);
        let registry = UploadRegistry::new(db.clone(), layout.clone());
        let chunks = ChunkStore::new(db.clone(), registry.clone(), layout.clone());
        let finalizer = Finalizer::new(registry.clone(), chunks.clone(), layout.clone());
        Self {
            db,
            layout,
            chunk_size: chunk_size.max(1),
            registry,
            chunks,
            finalizer,
        }
    }

    pub fn registry(&self) -> &UploadRegistry {
        &self.registry
    }

    pub fn chunks(&self) -> &ChunkStore {
        &self.chunks
    }

    pub fn sweeper(&self, stale_after: Duration, finalize_timeout: Duration) -> Sweeper {
        Sweeper::new(
            self.registry.clone(),
            self.chunks.clone(),
            stale_after,
            finalize_timeout,
        )
    }

    /// Resolve an upload by id (resume) or by fingerprint (find-or-create) and
    /// report the server's authoritative progress.
    pub async fn init(&self, req: &InitRequest) -> UploadResult<InitResponse> {
        let upload = match req.upload_id {
            Some(id) => {
                let upload = self.registry.reopen(id).await?;
                if let Some(fp) = req.fingerprint.as_deref() {
                    if fp != upload.fingerprint {
                        return Err(UploadError::FingerprintMismatch(id));
                    }
                }
                upload
            }
            None => {
                let fingerprint = req
                    .fingerprint
                    .as_deref()
                    .ok_or_else(|| UploadError::invalid("either uploadId or fingerprint is required"))?;
                if req.total_size == 0 {
                    return Err(UploadError::invalid("totalSize must be positive"));
                }
                let expected = ChunkLayout::new(req.total_size, self.chunk_size).total_chunks();
                if req.total_chunks != expected {
                    return Err(UploadError::invalid(format!(
                        "totalChunks must be {} for {} bytes at chunk size {}",
                        expected, req.total_size, self.chunk_size
                    )));
                }
                self.registry
                    .find_or_create(NewUpload {
                        fingerprint,
                        filename: &req.filename,
                        total_size: req.total_size,
                        chunk_size: self.chunk_size,
                    })
                    .await?
            }
        };

        let received_indices = self.chunks.received_indices(upload.id).await?;
        Ok(InitResponse {
            status: upload.status,
            upload_id: upload.id,
            received_indices,
            chunk_size: upload.chunk_size as u64,
            total_chunks: upload.total_chunks as u64,
            final_hash: upload.final_hash,
        })
    }

    pub async fn ingest(&self, upload_id: Uuid, chunk_index: u64, bytes: Bytes) -> UploadResult<ChunkAck> {
        self.chunks.ingest(upload_id, chunk_index, bytes).await
    }

    pub async fn finalize(&self, upload_id: Uuid) -> UploadResult<FinalizeOutcome> {
        self.finalizer.finalize(upload_id).await
    }

    /// The record plus its received indices.
    pub async fn status(&self, upload_id: Uuid) -> UploadResult<(Upload, Vec<u64>)> {
        let upload = self.registry.lookup(upload_id).await?;
        let received = self.chunks.received_indices(upload_id).await?;
        Ok((upload, received))
    }

    /// Destroy every trace of `upload_id` so its fingerprint can start over.
    ///
    /// Refused while a finalize owns the upload.
    pub async fn reset(&self, upload_id: Uuid) -> UploadResult<()> {
        let upload = self.registry.lookup(upload_id).await?;
        if upload.status == UploadStatus::Finalizing {
            return Err(UploadError::InvalidState {
                id: upload_id,
                actual: upload.status,
                required: UploadStatus::Receiving,
            });
        }
        if !self
            .registry
            .delete_unless(upload_id, UploadStatus::Finalizing)
            .await?
        {
            // Claimed by a finalize, or removed, since the lookup.
            let current = self.registry.lookup(upload_id).await?;
            return Err(UploadError::InvalidState {
                id: upload_id,
                actual: current.status,
                required: UploadStatus::Receiving,
            });
        }
        self.chunks.discard(upload_id).await?;
        info!(%upload_id, "upload reset");
        Ok(())
    }
}

//! Finalizer: promote a complete partial artifact, hash it, mark it done.
//!
//! Safe to call any number of times concurrently for the same upload. The
//! `RECEIVING -> FINALIZING` compare-and-swap elects exactly one caller to
//! rename and hash; everyone else gets the stored hash or `InProgress`.

use crate::{
    models::upload::{Upload, UploadStatus},
    services::{
        archive,
        chunk_store::ChunkStore,
        error::{UploadError, UploadResult},
        layout::ArtifactLayout,
        registry::UploadRegistry,
    },
};
use sha2::{Digest, Sha256};
use std::{io, path::Path};
use tokio::{fs, io::AsyncReadExt};
use tracing::{error, info, warn};
use uuid::Uuid;

const HASH_BUF_LEN: usize = 64 * 1024;

/// Result of a finalize call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalizeOutcome {
    /// Lowercase hex SHA-256 of the whole artifact.
    pub hash: String,
    /// Entry names when the artifact is a readable archive, else empty.
    pub entry_names: Vec<String>,
    /// True when a stored hash was returned without promoting or hashing.
    pub already_completed: bool,
}

#[derive(Clone)]
pub struct Finalizer {
    registry: UploadRegistry,
    chunks: ChunkStore,
    layout: ArtifactLayout,
}

impl Finalizer {
    pub fn new(registry: UploadRegistry, chunks: ChunkStore, layout: ArtifactLayout) -> Self {
        Self {
            registry,
            chunks,
            layout,
        }
    }

    pub async fn finalize(&self, upload_id: Uuid) -> UploadResult<FinalizeOutcome> {
        let upload = self.registry.lookup(upload_id).await?;
        if upload.status == UploadStatus::Completed {
            return self.stored_outcome(&upload).await;
        }

        if !self.chunks.is_complete(&upload).await? {
            return Err(UploadError::Incomplete {
                id: upload_id,
                received: self.chunks.received_count(upload_id).await?,
                total: upload.total_chunks as u64,
            });
        }

        if !self.claim(upload_id).await? {
            let current = self.registry.lookup(upload_id).await?;
            return match current.status {
                UploadStatus::Completed => self.stored_outcome(&current).await,
                _ => Err(UploadError::InProgress(upload_id)),
            };
        }

        match self.promote_and_hash(upload_id).await {
            Ok(hash) => {
                if !self.registry.complete(upload_id, &hash).await? {
                    let current = self.registry.lookup(upload_id).await?;
                    return Err(UploadError::InvalidState {
                        id: upload_id,
                        actual: current.status,
                        required: UploadStatus::Finalizing,
                    });
                }
                let entry_names = archive::list_entries(self.layout.final_path(upload_id)).await;
                Ok(FinalizeOutcome {
                    hash,
                    entry_names,
                    already_completed: false,
                })
            }
            Err(err) => {
                error!(%upload_id, "finalize failed: {}", err);
                if let Err(mark_err) = self
                    .registry
                    .transition(upload_id, UploadStatus::Finalizing, UploadStatus::Error)
                    .await
                {
                    warn!(%upload_id, "could not mark upload as errored: {}", mark_err);
                }
                Err(err)
            }
        }
    }

    /// Take ownership of finalization, either fresh or as a retry after `ERROR`.
    async fn claim(&self, upload_id: Uuid) -> UploadResult<bool> {
        if self
            .registry
            .transition(upload_id, UploadStatus::Receiving, UploadStatus::Finalizing)
            .await?
        {
            return Ok(true);
        }
        self.registry
            .transition(upload_id, UploadStatus::Error, UploadStatus::Finalizing)
            .await
    }

    async fn promote_and_hash(&self, upload_id: Uuid) -> UploadResult<String> {
        let final_path = self.layout.final_path(upload_id);
        {
            let _sealed = self.chunks.seal(upload_id).await;
            if self.layout.is_promoted(upload_id).await? {
                info!(%upload_id, "artifact already promoted, resuming at hash");
            } else {
                fs::create_dir_all(self.layout.final_dir()).await?;
                fs::rename(self.layout.partial_path(upload_id), &final_path).await?;
                info!(%upload_id, path = %final_path.display(), "artifact promoted");
            }
        }
        Ok(sha256_file(&final_path).await?)
    }

    async fn stored_outcome(&self, upload: &Upload) -> UploadResult<FinalizeOutcome> {
        let hash = upload.final_hash.clone().ok_or(UploadError::InvalidState {
            id: upload.id,
            actual: upload.status,
            required: UploadStatus::Completed,
        })?;
        let entry_names = archive::list_entries(self.layout.final_path(upload.id)).await;
        Ok(FinalizeOutcome {
            hash,
            entry_names,
            already_completed: true,
        })
    }
}

/// Stream a file through SHA-256 and return the lowercase hex digest.
pub async fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_LEN];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

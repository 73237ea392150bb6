//! On-disk placement of partial and promoted artifacts.
//!
//! ```text
//! {root}/partial/{upload_id}.part   written by the chunk store
//! {root}/final/{upload_id}.bin      produced by the finalizer's rename
//! ```
//!
//! Both directories live under the same root so promotion is a same-filesystem
//! rename.

use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partial_dir(&self) -> PathBuf {
        self.root.join("partial")
    }

    pub fn final_dir(&self) -> PathBuf {
        self.root.join("final")
    }

    pub fn partial_path(&self, id: Uuid) -> PathBuf {
        self.partial_dir().join(format!("{}.part", id))
    }

    pub fn final_path(&self, id: Uuid) -> PathBuf {
        self.final_dir().join(format!("{}.bin", id))
    }

    pub async fn ensure_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(self.partial_dir()).await?;
        fs::create_dir_all(self.final_dir()).await
    }

    pub async fn is_promoted(&self, id: Uuid) -> io::Result<bool> {
        fs::try_exists(self.final_path(id)).await
    }

    /// Remove a file, treating "already gone" as success.
    pub async fn remove_if_exists(path: &Path) -> io::Result<bool> {
        match fs::remove_file(path).await {
            Ok(_) => {
                debug!("removed {}", path.display());
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }
}

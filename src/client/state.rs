//! Advisory local record of the upload in progress.
//!
//! The server's received set is authoritative; this file only remembers
//! which upload id belongs to which fingerprint between runs.

use crate::client::{error::TransferResult, fingerprint::Fingerprint};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::{fs, sync::Mutex};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalState {
    pub fingerprint: Fingerprint,
    pub upload_id: Uuid,
    pub filename: String,
    pub size: u64,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub received_indices: Vec<u64>,
    pub updated_at: DateTime<Utc>,
}

/// One JSON file, replaced atomically through a sibling temp file.
#[derive(Debug)]
pub struct LocalStateStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl LocalStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The stored record, or `None` when absent or unreadable.
    pub async fn load(&self) -> TransferResult<Option<LocalState>> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_slice(&raw) {
            Ok(state) => Ok(Some(state)),
            Err(err) => {
                warn!(path = %self.path.display(), "ignoring corrupt local state: {}", err);
                Ok(None)
            }
        }
    }

    /// Persist the record produced by `snapshot`.
    ///
    /// `snapshot` runs under the write lock, so the last write always carries
    /// the newest state even when several workers save at once.
    pub async fn save_with<F>(&self, snapshot: F) -> TransferResult<()>
    where
        F: FnOnce() -> LocalState,
    {
        let _guard = self.write_lock.lock().await;
        let state = snapshot();
        let json = serde_json::to_vec_pretty(&state)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &json).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    pub async fn save(&self, state: &LocalState) -> TransferResult<()> {
        self.save_with(|| state.clone()).await
    }

    pub async fn clear(&self) -> TransferResult<()> {
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

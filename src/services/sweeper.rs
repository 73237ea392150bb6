//! Periodic reclamation of abandoned uploads.
//!
//! - `RECEIVING` uploads older than `stale_after` lose their chunk facts,
//!   record and partial artifact.
//! - `FINALIZING` uploads untouched for `finalize_timeout` (a finalizer died
//!   mid-flight) are moved to `ERROR` so a retried finalize can claim them.

use crate::{
    models::upload::{Upload, UploadStatus},
    services::{chunk_store::ChunkStore, error::UploadResult, registry::UploadRegistry},
};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reclaimed: usize,
    pub recovered: usize,
}

#[derive(Clone)]
pub struct Sweeper {
    registry: UploadRegistry,
    chunks: ChunkStore,
    stale_after: Duration,
    finalize_timeout: Duration,
}

impl Sweeper {
    pub fn new(
        registry: UploadRegistry,
        chunks: ChunkStore,
        stale_after: Duration,
        finalize_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            chunks,
            stale_after,
            finalize_timeout,
        }
    }

    pub async fn sweep_once(&self, now: DateTime<Utc>) -> UploadResult<SweepReport> {
        let mut report = SweepReport::default();

        let stale_cutoff = cutoff(now, self.stale_after);
        for upload in self.registry.stale_receiving(stale_cutoff).await? {
            if self.reclaim(&upload).await? {
                report.reclaimed += 1;
            }
        }

        let stuck_cutoff = cutoff(now, self.finalize_timeout);
        for upload in self.registry.stuck_finalizing(stuck_cutoff).await? {
            if self
                .registry
                .transition(upload.id, UploadStatus::Finalizing, UploadStatus::Error)
                .await?
            {
                warn!(upload_id = %upload.id, "finalize stalled, released for retry");
                report.recovered += 1;
            }
        }

        Ok(report)
    }

    /// Remove a stale upload unless a finalize claimed it after it was listed.
    async fn reclaim(&self, upload: &Upload) -> UploadResult<bool> {
        if !self
            .registry
            .delete_if(upload.id, UploadStatus::Receiving)
            .await?
        {
            return Ok(false);
        }
        if let Err(err) = self.chunks.discard(upload.id).await {
            warn!(upload_id = %upload.id, "failed to remove artifacts of stale upload: {}", err);
        }
        info!(upload_id = %upload.id, created_at = %upload.created_at, "stale upload reclaimed");
        Ok(true)
    }

    /// Run [`Self::sweep_once`] every `interval` until the runtime shuts down.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.sweep_once(Utc::now()).await {
                    Ok(report) if report != SweepReport::default() => {
                        info!(reclaimed = report.reclaimed, recovered = report.recovered, "sweep finished");
                    }
                    Ok(_) => {}
                    Err(err) => warn!("sweep failed: {}", err),
                }
            }
        })
    }
}

/// `now - age`, saturating at the earliest representable instant.
fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

//! Upload progress and ETA.

use serde::Serialize;
use std::{
    fmt,
    time::{Duration, Instant},
};

/// Estimated time to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "state", content = "secs")]
pub enum Eta {
    /// No chunk has completed since start, so there is no rate yet.
    Starting,
    Remaining(u64),
    Done,
}

/// Snapshot published after every completed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub done: u64,
    pub total: u64,
    pub percent: u8,
    pub eta: Eta,
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}% ({}/{})", self.percent, self.done, self.total)?;
        match self.eta {
            Eta::Starting => write!(f, ", starting"),
            Eta::Remaining(secs) => write!(f, ", ~{}s left", secs),
            Eta::Done => Ok(()),
        }
    }
}

/// Running average of seconds per chunk over the chunks completed since
/// `started`. Chunks already on the server at start do not count toward the
/// rate.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    started: Instant,
    total: u64,
    done: u64,
    completed_since_start: u64,
}

impl ProgressTracker {
    pub fn new(total: u64, already_done: u64) -> Self {
        Self {
            started: Instant::now(),
            total,
            done: already_done.min(total),
            completed_since_start: 0,
        }
    }

    pub fn record_chunk(&mut self) {
        self.done = (self.done + 1).min(self.total);
        self.completed_since_start += 1;
    }

    /// Replace the done count with server truth and restart the rate window.
    pub fn restart(&mut self, done: u64) {
        self.started = Instant::now();
        self.done = done.min(self.total);
        self.completed_since_start = 0;
    }

    pub fn snapshot(&self) -> Progress {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> Progress {
        let percent = if self.total == 0 {
            100
        } else {
            (self.done * 100 / self.total) as u8
        };
        let remaining = self.total - self.done;
        let eta = if remaining == 0 {
            Eta::Done
        } else if self.completed_since_start == 0 {
            Eta::Starting
        } else {
            let elapsed = now.saturating_duration_since(self.started);
            let per_chunk = elapsed.as_secs_f64() / self.completed_since_start as f64;
            Eta::Remaining(((remaining as f64 * per_chunk).ceil() as u64).max(1))
        };
        Progress {
            done: self.done,
            total: self.total,
            percent,
            eta,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

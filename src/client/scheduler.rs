//! Bounded-parallel chunk scheduler.
//!
//! Workers share one mutex-guarded queue of missing indices. The lock is
//! never held across an await. The last worker to find the queue drained,
//! nothing in flight and every chunk acknowledged wins an `AtomicBool` swap
//! and calls finalize; everyone else exits.

use crate::{
    client::{
        api::TransferApi,
        error::{TransferError, TransferResult},
        fingerprint::Fingerprint,
        progress::{Progress, ProgressTracker},
        source::ChunkSource,
        state::{LocalState, LocalStateStore},
    },
    models::chunk::ChunkLayout,
    protocol::InitRequest,
};
use chrono::Utc;
use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    future::Future,
    pin::Pin,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_PARALLEL: usize = 3;

/// Exponential backoff with a per-index attempt cap.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            cap: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(1u32 << exp).min(self.cap)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub max_parallel: usize,
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerStatus {
    Running,
    Paused,
    Finalizing,
    Completed {
        hash: String,
        entry_names: Vec<String>,
        already_completed: bool,
    },
    Failed {
        reason: String,
    },
    Cancelled,
}

impl SchedulerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SchedulerStatus::Completed { .. }
                | SchedulerStatus::Failed { .. }
                | SchedulerStatus::Cancelled
        )
    }

    fn is_settled(&self) -> bool {
        self.is_terminal() || *self == SchedulerStatus::Paused
    }
}

/// A server-side upload and the indices the server already holds.
#[derive(Debug, Clone)]
pub struct UploadPlan {
    pub upload_id: Uuid,
    pub fingerprint: Fingerprint,
    pub layout: ChunkLayout,
    pub received: BTreeSet<u64>,
}

impl UploadPlan {
    pub fn missing(&self) -> Vec<u64> {
        self.layout
            .indices()
            .filter(|i| !self.received.contains(i))
            .collect()
    }
}

#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

struct Shared {
    upload_id: Uuid,
    fingerprint: Fingerprint,
    layout: ChunkLayout,
    api: Arc<dyn TransferApi>,
    source: Arc<dyn ChunkSource>,
    store: Option<Arc<LocalStateStore>>,
    config: SchedulerConfig,
    state: Mutex<QueueState>,
    paused: AtomicBool,
    finalize_claimed: AtomicBool,
    cancel: CancellationToken,
    progress: watch::Sender<Progress>,
    status: watch::Sender<SchedulerStatus>,
}

struct QueueState {
    queue: VecDeque<u64>,
    in_flight: BTreeSet<u64>,
    done: BTreeSet<u64>,
    attempts: HashMap<u64, u32>,
    resyncs: u32,
    workers: usize,
    tracker: ProgressTracker,
}

enum Step {
    Transfer(u64),
    Finalize,
    Exit,
}

impl Scheduler {
    /// Queue every index the server lacks and launch up to `max_parallel`
    /// workers.
    pub fn start(
        plan: UploadPlan,
        api: Arc<dyn TransferApi>,
        source: Arc<dyn ChunkSource>,
        store: Option<Arc<LocalStateStore>>,
        config: SchedulerConfig,
    ) -> Self {
        let total = plan.layout.total_chunks();
        let queue: VecDeque<u64> = plan.missing().into();
        let done: BTreeSet<u64> = plan.received.iter().copied().filter(|i| *i < total).collect();
        let tracker = ProgressTracker::new(total, done.len() as u64);

        info!(
            upload_id = %plan.upload_id,
            total,
            missing = queue.len(),
            "starting transfer"
        );

        let (progress, _) = watch::channel(tracker.snapshot());
        let (status, _) = watch::channel(SchedulerStatus::Running);
        let shared = Arc::new(Shared {
            upload_id: plan.upload_id,
            fingerprint: plan.fingerprint,
            layout: plan.layout,
            api,
            source,
            store,
            config: SchedulerConfig {
                max_parallel: config.max_parallel.max(1),
                ..config
            },
            state: Mutex::new(QueueState {
                queue,
                in_flight: BTreeSet::new(),
                done,
                attempts: HashMap::new(),
                resyncs: 0,
                workers: 0,
                tracker,
            }),
            paused: AtomicBool::new(false),
            finalize_claimed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            progress,
            status,
        });
        spawn_workers(&shared);
        Self { shared }
    }

    /// Stop dispatching new chunks. In-flight transfers still complete.
    pub fn pause(&self) {
        if !self.shared.paused.swap(true, Ordering::SeqCst) {
            info!(upload_id = %self.shared.upload_id, "pausing");
        }
    }

    /// Re-derive the missing set from the server and relaunch workers.
    pub async fn resume(&self) -> TransferResult<()> {
        let shared = &self.shared;
        if shared.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        if matches!(self.status(), SchedulerStatus::Completed { .. }) {
            return Ok(());
        }
        shared.paused.store(false, Ordering::SeqCst);
        shared.resync().await?;

        if matches!(self.status(), SchedulerStatus::Failed { .. }) {
            let mut st = shared.lock();
            st.attempts.clear();
            st.resyncs = 0;
            shared.finalize_claimed.store(false, Ordering::SeqCst);
        }
        shared.status.send_if_modified(|s| {
            if *s == SchedulerStatus::Finalizing {
                return false;
            }
            *s = SchedulerStatus::Running;
            true
        });
        info!(upload_id = %shared.upload_id, "resuming");
        spawn_workers(shared);
        Ok(())
    }

    /// Cooperative stop: workers exit at their next scheduling point and
    /// backoff sleeps end early. Local state is kept for a later run.
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
        let idle = self.shared.lock().workers == 0;
        if idle {
            self.shared.settle();
        }
    }

    /// Resolve once the scheduler is paused and drained, or finished.
    pub async fn wait(&self) -> SchedulerStatus {
        let mut rx = self.shared.status.subscribe();
        match rx.wait_for(SchedulerStatus::is_settled).await {
            Ok(status) => status.clone(),
            Err(_) => self.status(),
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        self.shared.status.borrow().clone()
    }

    pub fn progress(&self) -> Progress {
        *self.shared.progress.borrow()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<Progress> {
        self.shared.progress.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SchedulerStatus> {
        self.shared.status.subscribe()
    }

    pub fn upload_id(&self) -> Uuid {
        self.shared.upload_id
    }

    /// Indices acknowledged by the server so far.
    pub fn done_indices(&self) -> Vec<u64> {
        self.shared.lock().done.iter().copied().collect()
    }
}

fn spawn_workers(shared: &Arc<Shared>) {
    let n = {
        let mut st = shared.lock();
        let n = shared.config.max_parallel.saturating_sub(st.workers);
        st.workers += n;
        n
    };
    debug!(upload_id = %shared.upload_id, workers = n, "spawning workers");
    for _ in 0..n {
        tokio::spawn(run_worker(Arc::clone(shared)));
    }
}

// Boxed so a worker can spawn its peers after a resync.
fn run_worker(shared: Arc<Shared>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        let _worker = WorkerGuard(&shared);
        loop {
            let keep_going = match shared.next_step() {
                Step::Exit => break,
                Step::Transfer(index) => shared.transfer(index).await,
                Step::Finalize => {
                    let requeued = shared.finalize().await;
                    if requeued {
                        spawn_workers(&shared);
                    }
                    requeued
                }
            };
            if !keep_going {
                break;
            }
        }
    })
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_step(&self) -> Step {
        if self.cancel.is_cancelled()
            || self.paused.load(Ordering::SeqCst)
            || self.status.borrow().is_terminal()
        {
            return Step::Exit;
        }
        let mut st = self.lock();
        if let Some(index) = st.queue.pop_front() {
            st.in_flight.insert(index);
            return Step::Transfer(index);
        }
        if st.in_flight.is_empty()
            && st.done.len() as u64 == self.layout.total_chunks()
            && !self.finalize_claimed.swap(true, Ordering::SeqCst)
        {
            return Step::Finalize;
        }
        Step::Exit
    }

    /// Send one chunk. Returns whether the worker should keep looping.
    async fn transfer(&self, index: u64) -> bool {
        let mut guard = TransferGuard::new(self, index);
        match self.send(index).await {
            Ok(etag) => {
                debug!(upload_id = %self.upload_id, chunk_index = index, %etag, "chunk acknowledged");
                self.record_done(index);
                self.persist().await;
                guard.settled = true;
                true
            }
            Err(TransferError::Stale(msg)) => {
                // The server closed the upload; stop dispatching and let
                // finalize report what it holds.
                warn!(upload_id = %self.upload_id, chunk_index = index, "upload closed on server: {}", msg);
                guard.settled = true;
                drop(guard);
                self.lock().queue.clear();
                if self.finalize_claimed.swap(true, Ordering::SeqCst) {
                    return true;
                }
                self.finalize().await
            }
            Err(err) if err.is_retryable() => {
                let attempts = {
                    let mut st = self.lock();
                    let n = st.attempts.entry(index).or_insert(0);
                    *n += 1;
                    *n
                };
                if attempts >= self.config.retry.max_attempts {
                    guard.settled = true;
                    self.fail(TransferError::RetriesExhausted {
                        index,
                        attempts,
                        last: err.to_string(),
                    });
                    return false;
                }
                let delay = self.config.retry.delay(attempts);
                warn!(
                    upload_id = %self.upload_id,
                    chunk_index = index,
                    attempts,
                    ?delay,
                    "chunk failed, retrying: {}",
                    err
                );
                // the guard requeues the index once the backoff is over
                self.sleep_unless_cancelled(delay).await
            }
            Err(err) => {
                guard.settled = true;
                self.fail(err);
                false
            }
        }
    }

    async fn send(&self, index: u64) -> TransferResult<String> {
        let range = self
            .layout
            .range(index)
            .ok_or_else(|| TransferError::Protocol(format!("chunk index {} out of range", index)))?;
        let bytes = self.source.read_range(range).await?;
        let ack = self.api.send_chunk(self.upload_id, index, bytes).await?;
        Ok(ack.etag)
    }

    fn record_done(&self, index: u64) {
        let mut st = self.lock();
        if st.done.insert(index) {
            st.tracker.record_chunk();
        }
        self.progress.send_replace(st.tracker.snapshot());
    }

    async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(err) = store.save_with(|| self.local_state()).await {
            warn!(upload_id = %self.upload_id, "failed to persist local state: {}", err);
        }
    }

    fn local_state(&self) -> LocalState {
        let st = self.lock();
        LocalState {
            fingerprint: self.fingerprint.clone(),
            upload_id: self.upload_id,
            filename: self.source.name().to_string(),
            size: self.source.size(),
            content_type: self.source.content_type().map(str::to_string),
            received_indices: st.done.iter().copied().collect(),
            updated_at: Utc::now(),
        }
    }

    /// Returns whether the worker should keep looping, which only happens
    /// when the server lost chunks and they were queued again.
    async fn finalize(&self) -> bool {
        self.status.send_replace(SchedulerStatus::Finalizing);
        let mut attempts = 0;
        loop {
            match self.api.finalize(self.upload_id).await {
                Ok(resp) => {
                    info!(
                        upload_id = %self.upload_id,
                        hash = %resp.hash,
                        already_completed = resp.already_completed,
                        "upload finalized"
                    );
                    if let Some(store) = &self.store {
                        if let Err(err) = store.clear().await {
                            warn!("failed to clear local state: {}", err);
                        }
                    }
                    {
                        let mut st = self.lock();
                        let total = self.layout.total_chunks();
                        st.done = self.layout.indices().collect();
                        st.tracker.restart(total);
                        self.progress.send_replace(st.tracker.snapshot());
                    }
                    self.status.send_replace(SchedulerStatus::Completed {
                        hash: resp.hash,
                        entry_names: resp.entry_names,
                        already_completed: resp.already_completed,
                    });
                    return false;
                }
                Err(TransferError::Incomplete(msg)) => {
                    let resyncs = {
                        let mut st = self.lock();
                        st.resyncs += 1;
                        st.resyncs
                    };
                    if resyncs > self.config.retry.max_attempts {
                        self.fail(TransferError::Incomplete(msg));
                        return false;
                    }
                    warn!(upload_id = %self.upload_id, "server is missing chunks, resynchronising: {}", msg);
                    if let Err(err) = self.resync().await {
                        self.fail(err);
                        return false;
                    }
                    self.finalize_claimed.store(false, Ordering::SeqCst);
                    self.status.send_replace(SchedulerStatus::Running);
                    return true;
                }
                Err(err) if err.is_retryable() => {
                    attempts += 1;
                    if attempts >= self.config.retry.max_attempts {
                        self.fail(err);
                        return false;
                    }
                    let delay = self.config.retry.delay(attempts);
                    debug!(upload_id = %self.upload_id, attempts, ?delay, "finalize retry: {}", err);
                    if !self.sleep_unless_cancelled(delay).await {
                        return false;
                    }
                }
                Err(err) => {
                    self.fail(err);
                    return false;
                }
            }
        }
    }

    /// Replace the done set with the server's received set and queue the rest.
    async fn resync(&self) -> TransferResult<()> {
        let req = InitRequest {
            fingerprint: Some(self.fingerprint.as_str().to_string()),
            filename: self.source.name().to_string(),
            total_size: self.layout.total_size,
            total_chunks: self.layout.total_chunks(),
            upload_id: Some(self.upload_id),
        };
        let resp = self.api.init(&req).await?;
        if resp.upload_id != self.upload_id {
            return Err(TransferError::Protocol(format!(
                "server resumed {} instead of {}",
                resp.upload_id, self.upload_id
            )));
        }
        let total = self.layout.total_chunks();
        let server: BTreeSet<u64> = resp
            .received_indices
            .into_iter()
            .filter(|i| *i < total)
            .collect();

        let mut st = self.lock();
        let queue: VecDeque<u64> = self
            .layout
            .indices()
            .filter(|i| !server.contains(i) && !st.in_flight.contains(i))
            .collect();
        info!(
            upload_id = %self.upload_id,
            received = server.len(),
            missing = queue.len(),
            "resynchronised with server"
        );
        st.queue = queue;
        st.done = server;
        let done = st.done.len() as u64;
        st.tracker.restart(done);
        self.progress.send_replace(st.tracker.snapshot());
        Ok(())
    }

    async fn sleep_unless_cancelled(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn fail(&self, err: TransferError) {
        error!(upload_id = %self.upload_id, "transfer failed: {}", err);
        self.status.send_if_modified(|s| {
            if s.is_terminal() {
                return false;
            }
            *s = SchedulerStatus::Failed {
                reason: err.to_string(),
            };
            true
        });
    }

    /// Publish `Cancelled` or `Paused` once no worker is left.
    fn settle(&self) {
        let next = if self.cancel.is_cancelled() {
            SchedulerStatus::Cancelled
        } else if self.paused.load(Ordering::SeqCst) {
            SchedulerStatus::Paused
        } else {
            return;
        };
        self.status.send_if_modified(|s| {
            if s.is_terminal() || *s == next {
                return false;
            }
            *s = next;
            true
        });
    }
}

/// Releases an in-flight index on every exit path. Unless settled, the index
/// goes back on the queue.
struct TransferGuard<'a> {
    shared: &'a Shared,
    index: u64,
    settled: bool,
}

impl<'a> TransferGuard<'a> {
    fn new(shared: &'a Shared, index: u64) -> Self {
        Self {
            shared,
            index,
            settled: false,
        }
    }
}

impl Drop for TransferGuard<'_> {
    fn drop(&mut self) {
        let mut st = self.shared.lock();
        st.in_flight.remove(&self.index);
        if !self.settled && !st.done.contains(&self.index) {
            st.queue.push_back(self.index);
        }
    }
}

struct WorkerGuard<'a>(&'a Shared);

impl Drop for WorkerGuard<'_> {
    fn drop(&mut self) {
        let remaining = {
            let mut st = self.0.lock();
            st.workers = st.workers.saturating_sub(1);
            st.workers
        };
        if remaining > 0 {
            return;
        }
        if std::thread::panicking() {
            self.0.fail(TransferError::Protocol("transfer worker panicked".into()));
        }
        self.0.settle();
    }
}

//! Background invalidation sweeper.
//!
//! A supervisor task wakes on a fixed interval (or when poked), and when
//! scopes are pending hands one sweep to a [`BackgroundExecutor`] so the
//! store scan never runs on a query or write thread. At most one sweep runs
//! at a time; the state machine below enforces it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tokio::runtime::Handle;
use tokio::sync::{Notify, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::config::CacheConfig;
use super::dirty::DirtyScopes;
use super::error::CacheError;
use super::keys::CacheKey;
use super::store::WeightedStore;

const METRIC_SWEEP_MS: &str = "qrcache_sweep_ms";
const METRIC_SWEEP_REJECTED_TOTAL: &str = "qrcache_sweep_rejected_total";

/// A unit of sweep work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs sweep jobs away from request threads.
///
/// `execute` may refuse work (pool shut down, queue full); the sweeper backs
/// off and tries again.
pub trait BackgroundExecutor: Send + Sync {
    fn execute(&self, job: Job) -> Result<(), CacheError>;
}

/// Runs jobs on the tokio blocking pool.
#[derive(Debug, Clone)]
pub struct BlockingPoolExecutor {
    handle: Handle,
}

impl BlockingPoolExecutor {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Bind to the runtime of the calling context.
    pub fn current() -> Result<Self, CacheError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|err| CacheError::rejected(err.to_string()))
    }
}

impl BackgroundExecutor for BlockingPoolExecutor {
    fn execute(&self, job: Job) -> Result<(), CacheError> {
        drop(self.handle.spawn_blocking(job));
        Ok(())
    }
}

/// Sweeper lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReaperState {
    Idle = 0,
    Scheduled = 1,
    Running = 2,
    Closed = 3,
}

impl ReaperState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Scheduled,
            2 => Self::Running,
            _ => Self::Closed,
        }
    }
}

pub struct Reaper {
    store: Arc<WeightedStore>,
    dirty: Arc<DirtyScopes>,
    executor: Arc<dyn BackgroundExecutor>,
    interval: Duration,
    retry_backoff: Duration,
    state: AtomicU8,
    wake: Notify,
    shutdown: watch::Sender<bool>,
}

impl Reaper {
    pub fn new(
        store: Arc<WeightedStore>,
        dirty: Arc<DirtyScopes>,
        executor: Arc<dyn BackgroundExecutor>,
        config: &CacheConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            dirty,
            executor,
            interval: config.clean_interval(),
            retry_backoff: config.retry_backoff(),
            state: AtomicU8::new(ReaperState::Idle as u8),
            wake: Notify::new(),
            shutdown,
        }
    }

    pub fn state(&self) -> ReaperState {
        ReaperState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ReaperState::Closed
    }

    fn transition(&self, from: ReaperState, to: ReaperState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Queue a scope for the next sweep. Never scans on the caller's thread.
    pub fn mark_dirty(&self, scope: &str) {
        if !self.is_closed() {
            self.dirty.mark(scope);
        }
    }

    /// Drop pending scopes; used when a full clear supersedes them.
    pub fn clear_pending(&self) {
        self.dirty.clear();
    }

    pub fn pending_scopes(&self) -> usize {
        self.dirty.len()
    }

    /// Run the next tick now instead of waiting out the interval.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Spawn the supervisor onto `handle`.
    pub fn start(self: &Arc<Self>, handle: &Handle) -> JoinHandle<()> {
        let reaper = Arc::clone(self);
        handle.spawn(async move { reaper.run().await })
    }

    async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        debug!(interval_ms = self.interval.as_millis() as u64, "Sweeper started");

        while !self.is_closed() {
            let due = tokio::select! {
                _ = shutdown.changed() => false,
                _ = tokio::time::sleep(self.interval) => true,
                _ = self.wake.notified() => true,
            };
            if due {
                self.tick().await;
            }
        }

        debug!("Sweeper stopped");
    }

    /// One scheduling round. Returns how many entries the sweep removed.
    pub async fn tick(self: &Arc<Self>) -> usize {
        if self.dirty.is_empty() {
            return 0;
        }

        loop {
            if !self.transition(ReaperState::Idle, ReaperState::Scheduled) {
                // Closed, or a sweep is already in flight.
                return 0;
            }

            let (done_tx, done_rx) = oneshot::channel();
            let reaper = Arc::clone(self);
            let job: Job = Box::new(move || {
                let removed = reaper.reap();
                let _ = done_tx.send(removed);
            });

            match self.executor.execute(job) {
                Ok(()) => {
                    return match done_rx.await {
                        Ok(removed) => removed,
                        Err(_) => {
                            // Dropped unrun, or panicked mid-sweep.
                            warn!("Sweep job ended without reporting");
                            if !self.transition(ReaperState::Scheduled, ReaperState::Idle) {
                                self.transition(ReaperState::Running, ReaperState::Idle);
                            }
                            0
                        }
                    };
                }
                Err(err) => {
                    self.transition(ReaperState::Scheduled, ReaperState::Idle);
                    counter!(METRIC_SWEEP_REJECTED_TOTAL).increment(1);
                    warn!(
                        error = %err,
                        backoff_ms = self.retry_backoff.as_millis() as u64,
                        "Sweep rejected by executor, retrying"
                    );
                    if !self.backoff().await {
                        return 0;
                    }
                }
            }
        }
    }

    /// Wait out the retry backoff. Returns false once closed.
    async fn backoff(&self) -> bool {
        let mut shutdown = self.shutdown.subscribe();
        if self.is_closed() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(self.retry_backoff) => {}
            _ = shutdown.changed() => {}
        }
        !self.is_closed()
    }

    /// Sweep synchronously on the calling thread.
    ///
    /// Removes every entry whose scope was pending, plus every entry whose
    /// scope cannot be read back from its key. No-op when closed or when a
    /// sweep is already running.
    pub fn reap(&self) -> usize {
        if !self.transition(ReaperState::Scheduled, ReaperState::Running)
            && !self.transition(ReaperState::Idle, ReaperState::Running)
        {
            return 0;
        }

        let removed = self.sweep();

        // A close during the sweep keeps the state at Closed.
        self.transition(ReaperState::Running, ReaperState::Idle);
        removed
    }

    fn sweep(&self) -> usize {
        let started_at = Instant::now();
        let scopes = self.dirty.drain();

        let stale: Vec<CacheKey> = self
            .store
            .keys()
            .into_iter()
            .filter(|key| match key.shard_id() {
                Some(shard) => scopes.contains(&shard.index),
                None => true,
            })
            .collect();

        for key in &stale {
            trace!(
                shard = ?key.shard_id(),
                source = key.source_json().unwrap_or("<unreadable>"),
                "Invalidating cached query"
            );
        }
        let removed = self.store.invalidate_keys(&stale);
        let expired = self.store.purge_expired();

        let elapsed_ms = started_at.elapsed().as_secs_f64() * 1000.0;
        histogram!(METRIC_SWEEP_MS).record(elapsed_ms);

        debug!(
            scopes = scopes.len(),
            removed, expired, elapsed_ms, "Sweep finished"
        );
        removed
    }

    /// Stop the sweeper and drop every entry. Returns false if already closed.
    ///
    /// Safe to call while a sweep is running: that sweep finishes its batch
    /// and the supervisor exits instead of scheduling another.
    pub fn close(&self) -> bool {
        let previous =
            ReaperState::from_u8(self.state.swap(ReaperState::Closed as u8, Ordering::AcqRel));
        self.shutdown.send_replace(true);
        self.wake.notify_one();

        if previous == ReaperState::Closed {
            return false;
        }

        self.dirty.clear();
        let removed = self.store.invalidate_all();
        info!(removed, "Sweeper closed");
        true
    }
}

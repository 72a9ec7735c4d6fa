//! Cache engine facade.
//!
//! Owns the store, statistics and sweeper, and is the single instance the
//! hosting process hands to interceptors and the admin surface.

use std::sync::{Arc, Mutex};

use metrics::counter;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::CacheConfig;
use super::dirty::DirtyScopes;
use super::error::CacheError;
use super::keys::CacheKey;
use super::lock::mutex_lock;
use super::reaper::{BackgroundExecutor, Reaper, ReaperState};
use super::stats::{CacheStats, CacheStatsSnapshot};
use super::store::{CacheValue, WeightedStore};

const SOURCE: &str = "cache::engine";
const METRIC_MISS_TOTAL: &str = "qrcache_miss_total";

pub struct QueryResultCache {
    config: CacheConfig,
    store: Arc<WeightedStore>,
    stats: Arc<CacheStats>,
    reaper: Arc<Reaper>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl QueryResultCache {
    pub fn new(config: CacheConfig, executor: Arc<dyn BackgroundExecutor>) -> Self {
        let stats = Arc::new(CacheStats::new());
        let store = Arc::new(WeightedStore::new(&config, stats.clone()));
        let reaper = Arc::new(Reaper::new(
            store.clone(),
            Arc::new(DirtyScopes::new()),
            executor,
            &config,
        ));

        info!(
            max_weight_bytes = config.max_weight_bytes,
            segments = store.segment_count(),
            clean_interval_ms = config.clean_interval_ms,
            expire_ms = config.expire_ms,
            "Query result cache created"
        );

        Self {
            config,
            store,
            stats,
            reaper,
            supervisor: Mutex::new(None),
        }
    }

    /// Start the background sweeper on the current tokio runtime.
    /// Calling it again while the sweeper runs is a no-op.
    pub fn start_reaper(&self) -> Result<(), CacheError> {
        if self.reaper.is_closed() {
            return Err(CacheError::Closed);
        }
        let handle = Handle::try_current().map_err(|err| CacheError::rejected(err.to_string()))?;

        let mut supervisor = mutex_lock(&self.supervisor, SOURCE, "start_reaper");
        if supervisor.is_none() {
            *supervisor = Some(self.reaper.start(&handle));
        }
        Ok(())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look a key up, counting the lookup and any hit.
    pub fn lookup(&self, key: &CacheKey) -> Option<CacheValue> {
        let value = self.fetch(key);
        match value {
            Some(_) => self.record_hit(),
            None => self.record_miss(),
        }
        value
    }

    /// Read the stored bytes, counting only the lookup.
    ///
    /// The caller settles the outcome with [`record_hit`](Self::record_hit)
    /// once the bytes were actually served, or
    /// [`record_miss`](Self::record_miss) otherwise.
    pub fn fetch(&self, key: &CacheKey) -> Option<CacheValue> {
        self.stats.record_lookup();
        self.store.get(key)
    }

    pub fn record_hit(&self) {
        self.stats.record_hit();
    }

    pub fn record_miss(&self) {
        counter!(METRIC_MISS_TOTAL).increment(1);
    }

    /// Store a value. Returns false when closed or when the entry is too
    /// heavy to keep.
    pub fn insert(&self, key: CacheKey, value: CacheValue) -> bool {
        if self.reaper.is_closed() {
            return false;
        }
        if !self.store.put(key.clone(), value) {
            return false;
        }
        // Lost a race with close(): its full invalidation may already be done.
        if self.reaper.is_closed() {
            self.store.invalidate(&key);
            return false;
        }
        true
    }

    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.store.invalidate(key)
    }

    /// Defer invalidation of `scope` to the next sweep.
    pub fn mark_dirty(&self, scope: &str) {
        self.reaper.mark_dirty(scope);
    }

    /// Drop every entry and zero the counters, synchronously.
    pub fn mark_all_dirty(&self) {
        self.reaper.clear_pending();
        let removed = self.store.invalidate_all();
        self.stats.reset();
        info!(removed, "Query result cache cleared");
    }

    /// Invalidate the named scopes on the background sweeper as soon as it
    /// can run. An empty list clears everything.
    pub fn clear_scopes<S: AsRef<str>>(&self, scopes: &[S]) {
        if scopes.is_empty() {
            self.mark_all_dirty();
            return;
        }
        for scope in scopes {
            self.mark_dirty(scope.as_ref());
        }
        debug!(scopes = scopes.len(), "Scopes queued for sweep");
        self.reaper.wake();
    }

    pub fn stats_snapshot(&self) -> CacheStatsSnapshot {
        self.stats.snapshot(&self.store)
    }

    pub fn stats_snapshot_for<S: AsRef<str>>(&self, scopes: &[S]) -> CacheStatsSnapshot {
        self.stats.snapshot_for(&self.store, scopes)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn reaper(&self) -> &Arc<Reaper> {
        &self.reaper
    }

    pub fn reaper_state(&self) -> ReaperState {
        self.reaper.state()
    }

    pub fn is_closed(&self) -> bool {
        self.reaper.is_closed()
    }

    /// Stop sweeping and drop every entry. Idempotent.
    pub fn close(&self) {
        if self.reaper.close() {
            info!("Query result cache closed");
        }
    }

    /// Close and wait for the sweeper task to exit.
    pub async fn shutdown(&self) {
        self.close();
        let supervisor = mutex_lock(&self.supervisor, SOURCE, "shutdown").take();
        if let Some(handle) = supervisor
            && let Err(err) = handle.await
        {
            warn!(error = %err, "Sweeper task ended abnormally");
        }
    }
}

impl Drop for QueryResultCache {
    fn drop(&mut self) {
        self.reaper.close();
    }
}

//! Lookup and eviction statistics.

use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;
use serde::{Deserialize, Serialize};

use super::keys::CacheKey;
use super::store::{CacheValue, RemovalCause, RemovalListener, WeightedStore};

const METRIC_LOOKUP_TOTAL: &str = "qrcache_lookup_total";
const METRIC_HIT_TOTAL: &str = "qrcache_hit_total";
const METRIC_EVICT_TOTAL: &str = "qrcache_evict_total";

/// Monotonic counters shared by every query thread.
///
/// Occupancy is not tracked here; [`CacheStats::snapshot`] measures it from
/// the store at call time so evictions can never leave it drifting.
#[derive(Debug, Default)]
pub struct CacheStats {
    total: AtomicU64,
    hits: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_lookup(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_LOOKUP_TOTAL).increment(1);
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_HIT_TOTAL).increment(1);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Zero the counters. Hits go first so a concurrent reader never sees
    /// more hits than lookups for longer than the reset itself.
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.total.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Counters plus live occupancy of the whole store.
    pub fn snapshot(&self, store: &WeightedStore) -> CacheStatsSnapshot {
        self.snapshot_matching(store, |_| true)
    }

    /// Counters plus occupancy of entries belonging to `scopes`.
    pub fn snapshot_for<S: AsRef<str>>(
        &self,
        store: &WeightedStore,
        scopes: &[S],
    ) -> CacheStatsSnapshot {
        self.snapshot_matching(store, |key| {
            key.shard_id()
                .is_some_and(|shard| scopes.iter().any(|s| s.as_ref() == shard.index))
        })
    }

    fn snapshot_matching<F>(&self, store: &WeightedStore, mut include: F) -> CacheStatsSnapshot
    where
        F: FnMut(&CacheKey) -> bool,
    {
        let mut snapshot = CacheStatsSnapshot::default();
        for (key, value) in store.snapshot_entries() {
            if !include(&key) {
                continue;
            }
            snapshot.size += 1;
            snapshot.request_memory_size_in_bytes += key.ram_bytes_used() as u64;
            snapshot.response_memory_size_in_bytes += value.len() as u64;
        }

        let total = self.total();
        snapshot.total = total;
        snapshot.hits = self.hits().min(total);
        snapshot.evictions = self.evictions();
        snapshot
    }
}

impl RemovalListener for CacheStats {
    fn on_removal(&self, _key: &CacheKey, _value: &CacheValue, cause: RemovalCause) {
        if cause.was_evicted() {
            self.record_eviction();
            counter!(METRIC_EVICT_TOTAL, "cause" => cause.as_str()).increment(1);
        }
    }
}

/// Point-in-time view of cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatsSnapshot {
    pub size: u64,
    pub request_memory_size_in_bytes: u64,
    pub response_memory_size_in_bytes: u64,
    pub total: u64,
    pub hits: u64,
    pub evictions: u64,
}

impl CacheStatsSnapshot {
    pub fn add(&mut self, other: &CacheStatsSnapshot) {
        self.size += other.size;
        self.request_memory_size_in_bytes += other.request_memory_size_in_bytes;
        self.response_memory_size_in_bytes += other.response_memory_size_in_bytes;
        self.total += other.total;
        self.hits += other.hits;
        self.evictions += other.evictions;
    }

    pub fn memory_size_in_bytes(&self) -> u64 {
        self.request_memory_size_in_bytes + self.response_memory_size_in_bytes
    }

    pub fn misses(&self) -> u64 {
        self.total.saturating_sub(self.hits)
    }
}

impl AddAssign<&CacheStatsSnapshot> for CacheStatsSnapshot {
    fn add_assign(&mut self, other: &CacheStatsSnapshot) {
        self.add(other);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use bytes::Bytes;

    use super::*;
    use crate::cache::config::CacheConfig;
    use crate::cache::keys::build_key;
    use crate::cache::request::{SearchSource, ShardId, ShardSearchRequest};

    fn key(index: &str, shard: u32) -> CacheKey {
        build_key(&ShardSearchRequest::new(
            ShardId::new(index, shard),
            SearchSource::default(),
        ))
        .expect("key")
    }

    #[test]
    fn snapshot_measures_live_occupancy() {
        let stats = Arc::new(CacheStats::new());
        let store = WeightedStore::new(&CacheConfig::default(), stats.clone());

        let a = key("books", 0);
        let b = key("films", 0);
        store.put(a.clone(), Bytes::from_static(b"0123456789"));
        store.put(b.clone(), Bytes::from_static(b"abc"));

        let snapshot = stats.snapshot(&store);
        assert_eq!(snapshot.size, 2);
        assert_eq!(
            snapshot.request_memory_size_in_bytes,
            (a.ram_bytes_used() + b.ram_bytes_used()) as u64
        );
        assert_eq!(snapshot.response_memory_size_in_bytes, 13);

        let books = stats.snapshot_for(&store, &["books"]);
        assert_eq!(books.size, 1);
        assert_eq!(books.response_memory_size_in_bytes, 10);
    }

    #[test]
    fn only_store_initiated_removals_count_as_evictions() {
        let stats = Arc::new(CacheStats::new());
        let value = Bytes::from(vec![0_u8; 300]);
        let config = CacheConfig::default()
            .with_max_weight(1_000)
            .with_concurrency_level(1);
        let store = WeightedStore::new(&config, stats.clone());

        for shard in 0..5 {
            store.put(key("books", shard), value.clone());
        }
        let evicted = stats.evictions();
        assert_eq!(evicted, 5 - store.len() as u64);

        store.put(key("books", 4), value.clone());
        store.invalidate(&key("books", 4));
        store.invalidate_all();
        assert_eq!(stats.evictions(), evicted);
    }

    #[test]
    fn hits_never_exceed_total_under_concurrency() {
        let stats = Arc::new(CacheStats::new());
        let store = WeightedStore::new(&CacheConfig::default(), stats.clone());

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for i in 0..1_000 {
                        stats.record_lookup();
                        if i % 2 == 0 {
                            stats.record_hit();
                        }
                        if i % 250 == 0 {
                            stats.reset();
                        }
                    }
                })
            })
            .collect();

        for _ in 0..100 {
            let snapshot = stats.snapshot(&store);
            assert!(snapshot.hits <= snapshot.total);
        }
        for worker in workers {
            worker.join().expect("worker");
        }

        let snapshot = stats.snapshot(&store);
        assert!(snapshot.hits <= snapshot.total);
    }

    #[test]
    fn reset_zeroes_counters() {
        let stats = CacheStats::new();
        stats.record_lookup();
        stats.record_lookup();
        stats.record_hit();
        stats.record_eviction();

        stats.reset();
        assert_eq!((stats.total(), stats.hits(), stats.evictions()), (0, 0, 0));
    }

    #[test]
    fn snapshots_add_up() {
        let mut total = CacheStatsSnapshot {
            size: 1,
            request_memory_size_in_bytes: 10,
            response_memory_size_in_bytes: 20,
            total: 3,
            hits: 1,
            evictions: 0,
        };
        total += &CacheStatsSnapshot {
            size: 2,
            request_memory_size_in_bytes: 5,
            response_memory_size_in_bytes: 5,
            total: 4,
            hits: 4,
            evictions: 2,
        };

        assert_eq!(total.size, 3);
        assert_eq!(total.memory_size_in_bytes(), 40);
        assert_eq!(total.hits, 5);
        assert_eq!(total.misses(), 2);
        assert_eq!(total.evictions, 2);
    }
}

//! Weight-bounded entry store.
//!
//! Entries are spread over independently locked segments so query threads
//! only contend when they hash to the same segment. Each segment is an
//! access-ordered LRU with its own share of the global weight budget, which
//! keeps the total at or below the configured maximum without a global lock.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use lru::LruCache;
use metrics::counter;
use tracing::debug;

use super::config::CacheConfig;
use super::keys::CacheKey;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";
const MIN_SEGMENT_WEIGHT: u64 = 1024;
const METRIC_STORE_REJECT_TOTAL: &str = "qrcache_store_reject_total";

/// Serialized downstream response bytes.
pub type CacheValue = Bytes;

/// Why an entry left the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemovalCause {
    /// Removed by `invalidate*`.
    Explicit,
    /// Overwritten by a `put` for the same key.
    Replaced,
    /// Evicted to make room under the weight bound.
    Size,
    /// Not accessed within the expiry window.
    Expired,
}

impl RemovalCause {
    /// True for removals the store decided on by itself.
    pub fn was_evicted(self) -> bool {
        matches!(self, Self::Size | Self::Expired)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::Replaced => "replaced",
            Self::Size => "size",
            Self::Expired => "expired",
        }
    }
}

/// Receives every removal exactly once, after the segment lock is released.
pub trait RemovalListener: Send + Sync {
    fn on_removal(&self, key: &CacheKey, value: &CacheValue, cause: RemovalCause);
}

/// Listener that ignores removals.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRemovalListener;

impl RemovalListener for NoopRemovalListener {
    fn on_removal(&self, _key: &CacheKey, _value: &CacheValue, _cause: RemovalCause) {}
}

type Removal = (CacheKey, CacheValue, RemovalCause);

struct Slot {
    value: CacheValue,
    weight: u64,
    last_access: Instant,
}

struct Segment {
    entries: LruCache<CacheKey, Slot>,
    weight: u64,
    capacity: u64,
}

impl Segment {
    fn new(capacity: u64) -> Self {
        Self {
            entries: LruCache::unbounded(),
            weight: 0,
            capacity,
        }
    }

    fn remove(&mut self, key: &CacheKey) -> Option<Slot> {
        let slot = self.entries.pop(key)?;
        self.weight = self.weight.saturating_sub(slot.weight);
        Some(slot)
    }

    fn pop_lru(&mut self) -> Option<(CacheKey, Slot)> {
        let (key, slot) = self.entries.pop_lru()?;
        self.weight = self.weight.saturating_sub(slot.weight);
        Some((key, slot))
    }

    /// Access order means expired entries are always the LRU tail.
    fn purge_expired(&mut self, ttl: Option<Duration>, now: Instant, removed: &mut Vec<Removal>) {
        let Some(ttl) = ttl else {
            return;
        };
        while self
            .entries
            .peek_lru()
            .is_some_and(|(_, slot)| is_expired(slot, ttl, now))
        {
            if let Some((key, slot)) = self.pop_lru() {
                removed.push((key, slot.value, RemovalCause::Expired));
            }
        }
    }

    fn get(
        &mut self,
        key: &CacheKey,
        ttl: Option<Duration>,
        now: Instant,
        removed: &mut Vec<Removal>,
    ) -> Option<CacheValue> {
        match self.entries.get_mut(key) {
            None => return None,
            Some(slot) if ttl.is_some_and(|ttl| is_expired(slot, ttl, now)) => {}
            Some(slot) => {
                slot.last_access = now;
                return Some(slot.value.clone());
            }
        }

        if let Some(slot) = self.remove(key) {
            removed.push((key.clone(), slot.value, RemovalCause::Expired));
        }
        None
    }

    fn insert(
        &mut self,
        key: CacheKey,
        value: CacheValue,
        weight: u64,
        ttl: Option<Duration>,
        now: Instant,
        removed: &mut Vec<Removal>,
    ) -> bool {
        if let Some(old) = self.remove(&key) {
            removed.push((key.clone(), old.value, RemovalCause::Replaced));
        }
        if weight > self.capacity {
            return false;
        }

        self.purge_expired(ttl, now, removed);
        while self.weight + weight > self.capacity {
            match self.pop_lru() {
                Some((evicted, slot)) => removed.push((evicted, slot.value, RemovalCause::Size)),
                None => break,
            }
        }

        self.weight += weight;
        self.entries.put(
            key,
            Slot {
                value,
                weight,
                last_access: now,
            },
        );
        true
    }

    fn take_all(&mut self) -> LruCache<CacheKey, Slot> {
        self.weight = 0;
        std::mem::replace(&mut self.entries, LruCache::unbounded())
    }
}

fn is_expired(slot: &Slot, ttl: Duration, now: Instant) -> bool {
    now.saturating_duration_since(slot.last_access) >= ttl
}

/// Concurrent key to value store bounded by total byte weight.
pub struct WeightedStore {
    segments: Box<[RwLock<Segment>]>,
    expire_after_access: Option<Duration>,
    max_weight: u64,
    listener: Arc<dyn RemovalListener>,
}

impl WeightedStore {
    /// Create a store bounded by `config.max_weight_bytes`.
    pub fn new(config: &CacheConfig, listener: Arc<dyn RemovalListener>) -> Self {
        let max_weight = config.max_weight_bytes;
        let by_budget = usize::try_from((max_weight / MIN_SEGMENT_WEIGHT).max(1)).unwrap_or(1);
        let count = config.concurrency_level_non_zero().get().min(by_budget);
        let capacity = max_weight / count as u64;

        let segments = (0..count)
            .map(|_| RwLock::new(Segment::new(capacity)))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            segments,
            expire_after_access: config.expire_after_access(),
            max_weight,
            listener,
        }
    }

    /// Weight charged for an entry: key footprint plus value length.
    pub fn weigh(key: &CacheKey, value: &CacheValue) -> u64 {
        (key.ram_bytes_used() + value.len()) as u64
    }

    fn segment_for(&self, key: &CacheKey) -> &RwLock<Segment> {
        let index = (key.hash_code() % self.segments.len() as u64) as usize;
        &self.segments[index]
    }

    fn notify(&self, removed: Vec<Removal>) {
        for (key, value, cause) in &removed {
            self.listener.on_removal(key, value, *cause);
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheValue> {
        let mut removed = Vec::new();
        let value = rw_write(self.segment_for(key), SOURCE, "get").get(
            key,
            self.expire_after_access,
            Instant::now(),
            &mut removed,
        );
        self.notify(removed);
        value
    }

    /// Insert or replace an entry. Returns false when the entry alone is
    /// heavier than a segment's budget and was not stored.
    pub fn put(&self, key: CacheKey, value: CacheValue) -> bool {
        let weight = Self::weigh(&key, &value);
        let mut removed = Vec::new();
        let stored = rw_write(self.segment_for(&key), SOURCE, "put").insert(
            key,
            value,
            weight,
            self.expire_after_access,
            Instant::now(),
            &mut removed,
        );
        self.notify(removed);

        if !stored {
            counter!(METRIC_STORE_REJECT_TOTAL).increment(1);
            debug!(weight, "entry exceeds segment budget, not cached");
        }
        stored
    }

    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let slot = rw_write(self.segment_for(key), SOURCE, "invalidate").remove(key);
        match slot {
            Some(slot) => {
                self.listener
                    .on_removal(key, &slot.value, RemovalCause::Explicit);
                true
            }
            None => false,
        }
    }

    /// Remove every listed key. Returns how many were present.
    pub fn invalidate_keys<'a, I>(&self, keys: I) -> usize
    where
        I: IntoIterator<Item = &'a CacheKey>,
    {
        keys.into_iter().filter(|key| self.invalidate(key)).count()
    }

    /// Remove everything. Returns how many entries were dropped.
    pub fn invalidate_all(&self) -> usize {
        let mut removed = 0;
        for segment in self.segments.iter() {
            let drained = rw_write(segment, SOURCE, "invalidate_all").take_all();
            removed += drained.len();
            for (key, slot) in drained {
                self.listener
                    .on_removal(&key, &slot.value, RemovalCause::Explicit);
            }
        }
        removed
    }

    /// Physically drop entries that have outlived the access expiry.
    pub fn purge_expired(&self) -> usize {
        if self.expire_after_access.is_none() {
            return 0;
        }
        let now = Instant::now();
        let mut total = 0;
        for segment in self.segments.iter() {
            let mut removed = Vec::new();
            rw_write(segment, SOURCE, "purge_expired").purge_expired(
                self.expire_after_access,
                now,
                &mut removed,
            );
            total += removed.len();
            self.notify(removed);
        }
        total
    }

    /// Live entries, one segment at a time. Writers to a segment wait only
    /// while that segment is being copied.
    pub fn snapshot_entries(&self) -> Vec<(CacheKey, CacheValue)> {
        let now = Instant::now();
        let mut entries = Vec::new();
        for segment in self.segments.iter() {
            let guard = rw_read(segment, SOURCE, "snapshot_entries");
            entries.extend(
                guard
                    .entries
                    .iter()
                    .filter(|(_, slot)| {
                        !self
                            .expire_after_access
                            .is_some_and(|ttl| is_expired(slot, ttl, now))
                    })
                    .map(|(key, slot)| (key.clone(), slot.value.clone())),
            );
        }
        entries
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.snapshot_entries()
            .into_iter()
            .map(|(key, _)| key)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.segments
            .iter()
            .map(|segment| rw_read(segment, SOURCE, "len").entries.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current summed weight of stored entries.
    pub fn weight(&self) -> u64 {
        self.segments
            .iter()
            .map(|segment| rw_read(segment, SOURCE, "weight").weight)
            .sum()
    }

    pub fn max_weight(&self) -> u64 {
        self.max_weight
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::thread;

    use super::*;

    #[derive(Default)]
    struct RecordingListener {
        causes: Mutex<Vec<RemovalCause>>,
    }

    impl RecordingListener {
        fn count(&self, cause: RemovalCause) -> usize {
            self.causes
                .lock()
                .expect("listener lock")
                .iter()
                .filter(|c| **c == cause)
                .count()
        }
    }

    impl RemovalListener for RecordingListener {
        fn on_removal(&self, _key: &CacheKey, _value: &CacheValue, cause: RemovalCause) {
            self.causes.lock().expect("listener lock").push(cause);
        }
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::from_bytes(Bytes::copy_from_slice(name.as_bytes()))
    }

    fn value(len: usize) -> CacheValue {
        Bytes::from(vec![7_u8; len])
    }

    fn single_segment(max_weight: u64) -> CacheConfig {
        CacheConfig::default()
            .with_max_weight(max_weight)
            .with_concurrency_level(1)
    }

    #[test]
    fn put_get_roundtrip() {
        let store = WeightedStore::new(&CacheConfig::default(), Arc::new(NoopRemovalListener));

        assert!(store.get(&key("a")).is_none());
        assert!(store.put(key("a"), value(10)));
        assert_eq!(store.get(&key("a")), Some(value(10)));
        assert_eq!(store.len(), 1);
        assert_eq!(store.weight(), WeightedStore::weigh(&key("a"), &value(10)));
    }

    #[test]
    fn weight_bound_evicts_least_recently_accessed() {
        let listener = Arc::new(RecordingListener::default());
        let entry_weight = WeightedStore::weigh(&key("a"), &value(100));
        let store = WeightedStore::new(&single_segment(entry_weight * 3), listener.clone());

        store.put(key("a"), value(100));
        store.put(key("b"), value(100));
        store.put(key("c"), value(100));

        // Touch `a` so `b` becomes the eviction candidate.
        assert!(store.get(&key("a")).is_some());
        store.put(key("d"), value(100));

        assert!(store.get(&key("a")).is_some());
        assert!(store.get(&key("b")).is_none());
        assert!(store.get(&key("c")).is_some());
        assert!(store.get(&key("d")).is_some());
        assert!(store.weight() <= store.max_weight());
        assert_eq!(listener.count(RemovalCause::Size), 1);
    }

    #[test]
    fn weight_never_exceeds_maximum() {
        let listener = Arc::new(RecordingListener::default());
        let store = WeightedStore::new(&single_segment(2_000), listener.clone());

        let mut inserted = 0;
        for i in 0..200 {
            if store.put(key(&format!("k{i}")), value(50 + (i % 7) * 30)) {
                inserted += 1;
            }
            assert!(store.weight() <= store.max_weight());
        }

        assert_eq!(
            listener.count(RemovalCause::Size),
            inserted - store.len(),
            "every displaced entry is reported exactly once"
        );
    }

    #[test]
    fn oversized_entry_is_rejected() {
        let listener = Arc::new(RecordingListener::default());
        let store = WeightedStore::new(&single_segment(1_024), listener.clone());

        store.put(key("small"), value(10));
        assert!(!store.put(key("huge"), value(4_096)));
        assert!(store.get(&key("huge")).is_none());
        assert!(store.get(&key("small")).is_some());
        assert_eq!(listener.count(RemovalCause::Size), 0);
    }

    #[test]
    fn replacing_a_key_reports_replacement() {
        let listener = Arc::new(RecordingListener::default());
        let store = WeightedStore::new(&CacheConfig::default(), listener.clone());

        store.put(key("a"), value(10));
        store.put(key("a"), value(20));

        assert_eq!(store.get(&key("a")), Some(value(20)));
        assert_eq!(store.len(), 1);
        assert_eq!(store.weight(), WeightedStore::weigh(&key("a"), &value(20)));
        assert_eq!(listener.count(RemovalCause::Replaced), 1);
    }

    #[test]
    fn invalidate_removes_selected_keys() {
        let listener = Arc::new(RecordingListener::default());
        let store = WeightedStore::new(&CacheConfig::default(), listener.clone());

        for name in ["a", "b", "c"] {
            store.put(key(name), value(8));
        }

        let removed = store.invalidate_keys(&[key("a"), key("c"), key("missing")]);
        assert_eq!(removed, 2);
        assert_eq!(store.len(), 1);
        assert!(store.get(&key("b")).is_some());
        assert_eq!(listener.count(RemovalCause::Explicit), 2);
    }

    #[test]
    fn invalidate_all_empties_every_segment() {
        let listener = Arc::new(RecordingListener::default());
        let store = WeightedStore::new(&CacheConfig::default(), listener.clone());

        for i in 0..64 {
            store.put(key(&format!("k{i}")), value(16));
        }
        assert!(store.segment_count() > 1);

        assert_eq!(store.invalidate_all(), 64);
        assert!(store.is_empty());
        assert_eq!(store.weight(), 0);
        assert_eq!(listener.count(RemovalCause::Explicit), 64);
    }

    #[test]
    fn expired_entries_are_invisible_and_reported() {
        let listener = Arc::new(RecordingListener::default());
        let config = CacheConfig::default().with_expire(Duration::from_millis(30));
        let store = WeightedStore::new(&config, listener.clone());

        store.put(key("a"), value(8));
        store.put(key("b"), value(8));
        assert!(store.get(&key("a")).is_some());

        thread::sleep(Duration::from_millis(60));

        assert!(store.snapshot_entries().is_empty());
        assert!(store.get(&key("a")).is_none());
        assert_eq!(store.purge_expired(), 1);
        assert!(store.is_empty());
        assert_eq!(listener.count(RemovalCause::Expired), 2);
    }

    #[test]
    fn small_budget_uses_fewer_segments() {
        let config = CacheConfig::default().with_max_weight(100);
        let store = WeightedStore::new(&config, Arc::new(NoopRemovalListener));
        assert_eq!(store.segment_count(), 1);

        let store = WeightedStore::new(
            &CacheConfig::default().with_max_weight(4 * 1024),
            Arc::new(NoopRemovalListener),
        );
        assert_eq!(store.segment_count(), 4);
    }

    #[test]
    fn concurrent_access_with_small_budget() {
        let listener = Arc::new(RecordingListener::default());
        let config = CacheConfig::default()
            .with_max_weight(8 * 1024)
            .with_concurrency_level(4);
        let store = Arc::new(WeightedStore::new(&config, listener));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..500 {
                        let k = key(&format!("t{t}-k{}", i % 40));
                        if i % 3 == 0 {
                            store.invalidate(&k);
                        } else if store.get(&k).is_none() {
                            store.put(k, value(64 + (i % 5) * 40));
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("worker thread");
        }

        assert!(store.weight() <= store.max_weight());
        let live: u64 = store
            .snapshot_entries()
            .iter()
            .map(|(k, v)| WeightedStore::weigh(k, v))
            .sum();
        assert_eq!(live, store.weight());
    }
}

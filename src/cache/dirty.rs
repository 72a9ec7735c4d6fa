//! Pending invalidation scopes.
//!
//! Writers mark scopes from any thread; the sweeper swaps the whole set out
//! at the start of a sweep so scopes marked during the sweep wait for the
//! next one instead of being lost.

use std::collections::HashSet;
use std::sync::RwLock;

use dashmap::DashSet;
use metrics::gauge;
use tracing::debug;

use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::dirty";
const METRIC_DIRTY_SCOPES: &str = "qrcache_dirty_scopes";

#[derive(Debug, Default)]
pub struct DirtyScopes {
    current: RwLock<DashSet<String>>,
}

impl DirtyScopes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a scope for the next sweep. Returns false if it was already
    /// pending.
    pub fn mark(&self, scope: &str) -> bool {
        let set = rw_read(&self.current, SOURCE, "mark");
        let inserted = set.insert(scope.to_owned());
        if inserted {
            gauge!(METRIC_DIRTY_SCOPES).set(set.len() as f64);
            debug!(scope, "Scope marked dirty");
        }
        inserted
    }

    /// Take every pending scope, leaving a fresh empty set behind.
    pub fn drain(&self) -> HashSet<String> {
        let taken = std::mem::take(&mut *rw_write(&self.current, SOURCE, "drain"));
        gauge!(METRIC_DIRTY_SCOPES).set(0.0);
        taken.into_iter().collect()
    }

    /// Discard pending scopes without sweeping them.
    pub fn clear(&self) {
        rw_read(&self.current, SOURCE, "clear").clear();
        gauge!(METRIC_DIRTY_SCOPES).set(0.0);
    }

    pub fn len(&self) -> usize {
        rw_read(&self.current, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        rw_read(&self.current, SOURCE, "is_empty").is_empty()
    }
}

//! Shard-level search request model.
//!
//! Only the parts of a request that decide result content feed the cache key;
//! the rest (timeouts, routing preference, dispatch markers) travel alongside.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifies one shard of an index. The index name is the invalidation scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardId {
    pub index: String,
    pub shard: u32,
}

impl ShardId {
    pub fn new(index: impl Into<String>, shard: u32) -> Self {
        Self {
            index: index.into(),
            shard,
        }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.index, self.shard)
    }
}

/// How the coordinating node runs the query phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    #[default]
    QueryThenFetch,
    /// Scores depend on term statistics gathered from every shard first.
    DfsQueryThenFetch,
}

/// Search body as sent to a shard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSource {
    pub query: Option<Value>,
    pub post_filter: Option<Value>,
    pub from: Option<u32>,
    pub size: Option<u32>,
    pub sort: Vec<Value>,
    pub search_after: Vec<Value>,
    pub aggregations: Option<Value>,
    pub source_filter: Option<Value>,
    pub min_score: Option<f32>,
    pub track_total_hits: Option<bool>,
    pub timeout: Option<Duration>,
}

/// Per-request dispatch metadata. Never part of the fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    intercepted: bool,
}

impl RequestContext {
    /// True once the cache interceptor has handled this request.
    pub fn is_intercepted(&self) -> bool {
        self.intercepted
    }

    pub(crate) fn mark_intercepted(&mut self) {
        self.intercepted = true;
    }
}

/// A query-phase request addressed to a single shard.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShardSearchRequest {
    pub shard: ShardId,
    pub source: SearchSource,
    pub search_type: SearchType,
    pub scroll: Option<Duration>,
    pub request_cache: Option<bool>,
    pub preference: Option<String>,
    pub context: RequestContext,
}

impl Default for ShardId {
    fn default() -> Self {
        Self::new("", 0)
    }
}

impl ShardSearchRequest {
    pub fn new(shard: ShardId, source: SearchSource) -> Self {
        Self {
            shard,
            source,
            ..Default::default()
        }
    }

    pub fn with_search_type(mut self, search_type: SearchType) -> Self {
        self.search_type = search_type;
        self
    }

    pub fn with_scroll(mut self, keep_alive: Duration) -> Self {
        self.scroll = Some(keep_alive);
        self
    }

    pub fn with_request_cache(mut self, enabled: bool) -> Self {
        self.request_cache = Some(enabled);
        self
    }

    pub fn with_preference(mut self, preference: impl Into<String>) -> Self {
        self.preference = Some(preference.into());
        self
    }
}

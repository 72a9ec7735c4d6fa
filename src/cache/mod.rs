//! Shard query result cache.
//!
//! Memoizes the serialized query-phase result of a `(shard, search source)`
//! pair so repeated identical queries against an unchanged shard skip
//! execution:
//!
//! - **Keys**: deterministic fingerprints that carry their shard id
//! - **Store**: segmented, weight-bounded LRU with optional access expiry
//! - **Stats**: lookup, hit and eviction counters plus live occupancy
//! - **Reaper**: background sweeper that drops entries of mutated indices
//! - **Interceptor**: serve-on-hit, capture-on-miss dispatch wrapper
//!
//! ## Configuration
//!
//! Cache behavior is controlled via the `[cache]` section of `qrcache.toml`:
//!
//! ```toml
//! [cache]
//! clean_interval_ms = 10000
//! max_size = "1%"
//! expire_ms = 0
//! enabled_indices = ["logs", "books"]
//! ```

mod config;
mod dirty;
mod engine;
mod error;
mod interceptor;
mod keys;
mod lock;
mod reaper;
mod request;
mod response;
mod scope;
mod stats;
mod store;

pub use config::CacheConfig;
pub use dirty::DirtyScopes;
pub use engine::QueryResultCache;
pub use error::CacheError;
pub use interceptor::QueryCacheInterceptor;
pub use keys::{CacheKey, KEY_OVERHEAD_BYTES, build_key, hash_value};
pub use reaper::{BackgroundExecutor, BlockingPoolExecutor, Job, Reaper, ReaperState};
pub use request::{RequestContext, SearchSource, SearchType, ShardId, ShardSearchRequest};
pub use response::{CacheableResponse, ScoreDoc, ShardQueryResult};
pub use scope::{IndexSettingsRegistry, ScopeSettings};
pub use stats::{CacheStats, CacheStatsSnapshot};
pub use store::{CacheValue, NoopRemovalListener, RemovalCause, RemovalListener, WeightedStore};

//! Cache configuration.
//!
//! Resolved once at construction; changing any value means building a new
//! [`QueryResultCache`](super::QueryResultCache).

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

// Default values for cache configuration
const DEFAULT_CLEAN_INTERVAL_MS: u64 = 10_000;
const DEFAULT_MAX_WEIGHT_BYTES: u64 = 64 * 1024 * 1024;
const DEFAULT_EXPIRE_MS: u64 = 0;
const DEFAULT_CONCURRENCY_LEVEL: usize = 16;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 1_000;

/// Engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Interval between invalidation sweeps (ms).
    pub clean_interval_ms: u64,
    /// Upper bound on the summed weight of all entries.
    pub max_weight_bytes: u64,
    /// Expire entries not accessed for this long (ms). Zero disables expiry.
    pub expire_ms: u64,
    /// Number of independently locked store segments.
    pub concurrency_level: usize,
    /// Wait before retrying a sweep the executor rejected (ms).
    pub retry_backoff_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            clean_interval_ms: DEFAULT_CLEAN_INTERVAL_MS,
            max_weight_bytes: DEFAULT_MAX_WEIGHT_BYTES,
            expire_ms: DEFAULT_EXPIRE_MS,
            concurrency_level: DEFAULT_CONCURRENCY_LEVEL,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            clean_interval_ms: millis(settings.clean_interval),
            max_weight_bytes: settings.max_weight_bytes,
            expire_ms: settings.expire.map(millis).unwrap_or(0),
            concurrency_level: settings.concurrency_level.get(),
            retry_backoff_ms: millis(settings.retry_backoff),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl CacheConfig {
    pub fn clean_interval(&self) -> Duration {
        Duration::from_millis(self.clean_interval_ms.max(1))
    }

    /// `None` when access expiry is disabled.
    pub fn expire_after_access(&self) -> Option<Duration> {
        (self.expire_ms > 0).then(|| Duration::from_millis(self.expire_ms))
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.max(1))
    }

    /// Returns the concurrency level as NonZeroUsize, clamping to 1 if zero.
    pub fn concurrency_level_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.concurrency_level).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn with_max_weight(mut self, max_weight_bytes: u64) -> Self {
        self.max_weight_bytes = max_weight_bytes;
        self
    }

    pub fn with_expire(mut self, expire: Duration) -> Self {
        self.expire_ms = millis(expire);
        self
    }

    pub fn with_clean_interval(mut self, interval: Duration) -> Self {
        self.clean_interval_ms = millis(interval);
        self
    }

    pub fn with_concurrency_level(mut self, level: usize) -> Self {
        self.concurrency_level = level;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff_ms = millis(backoff);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.clean_interval(), Duration::from_secs(10));
        assert_eq!(config.max_weight_bytes, 64 * 1024 * 1024);
        assert!(config.expire_after_access().is_none());
        assert_eq!(config.concurrency_level, 16);
        assert_eq!(config.retry_backoff(), Duration::from_secs(1));
    }

    #[test]
    fn expiry_enabled_when_non_zero() {
        let config = CacheConfig::default().with_expire(Duration::from_millis(250));
        assert_eq!(config.expire_after_access(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn non_zero_clamps_to_min() {
        let config = CacheConfig::default().with_concurrency_level(0);
        assert_eq!(config.concurrency_level_non_zero().get(), 1);
    }

    #[test]
    fn deserializes_partial_config() {
        let config: CacheConfig =
            serde_json::from_str(r#"{"expire_ms": 5000}"#).expect("valid config");
        assert_eq!(config.expire_ms, 5000);
        assert_eq!(config.clean_interval_ms, 10_000);
    }
}

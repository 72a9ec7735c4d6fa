use thiserror::Error;

/// Faults raised inside the cache layer.
///
/// None of these ever reach a query's caller: the interceptor degrades to an
/// uncached call, and the sweeper logs and retries.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to serialize {context}: {detail}")]
    Serialization {
        context: &'static str,
        detail: String,
    },
    #[error("background executor rejected work: {0}")]
    SchedulingRejected(String),
    #[error("query result cache is closed")]
    Closed,
}

impl CacheError {
    pub fn serialization(context: &'static str, detail: impl Into<String>) -> Self {
        Self::Serialization {
            context,
            detail: detail.into(),
        }
    }

    pub fn rejected(detail: impl Into<String>) -> Self {
        Self::SchedulingRejected(detail.into())
    }
}

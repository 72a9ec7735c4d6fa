use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register metric descriptions with the installed recorder. Runs once.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "qrcache_lookup_total",
            Unit::Count,
            "Total number of query result cache lookups."
        );
        describe_counter!(
            "qrcache_hit_total",
            Unit::Count,
            "Total number of lookups served from the cache."
        );
        describe_counter!(
            "qrcache_miss_total",
            Unit::Count,
            "Total number of lookups that fell through to shard execution."
        );
        describe_counter!(
            "qrcache_evict_total",
            Unit::Count,
            "Entries removed by the cache itself, labelled by cause (size|expired)."
        );
        describe_counter!(
            "qrcache_store_reject_total",
            Unit::Count,
            "Responses not cached because they exceed a segment's weight budget."
        );
        describe_counter!(
            "qrcache_sweep_rejected_total",
            Unit::Count,
            "Sweeps the background executor refused and that were retried."
        );
        describe_gauge!(
            "qrcache_dirty_scopes",
            Unit::Count,
            "Number of indices waiting for the next invalidation sweep."
        );
        describe_histogram!(
            "qrcache_sweep_ms",
            Unit::Milliseconds,
            "Invalidation sweep latency in milliseconds."
        );
    });
}

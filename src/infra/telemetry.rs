use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
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

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "cache_hit_total",
            Unit::Count,
            "Tree query reads served from the shared cache."
        );
        describe_counter!(
            "cache_miss_total",
            Unit::Count,
            "Tree query reads computed by the query engine."
        );
        describe_histogram!(
            "query_duration_seconds",
            Unit::Seconds,
            "Latency of cache-backed tree queries."
        );
        describe_counter!(
            "cache_eviction_total",
            Unit::Count,
            "Cache entries evicted by flushes, per scope mode."
        );
        describe_histogram!(
            "cache_eviction_duration_seconds",
            Unit::Seconds,
            "Time spent evicting one invalidation scope."
        );
        describe_counter!(
            "flush_debounce_total",
            Unit::Count,
            "Debounce decisions (scheduled, collapsed, fail_open, rejected)."
        );
        describe_counter!(
            "flush_job_total",
            Unit::Count,
            "Flush job attempts by status and scope mode."
        );
        describe_histogram!(
            "flush_job_duration_seconds",
            Unit::Seconds,
            "Flush job run time, including retries."
        );
    });
}

use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::metric_names::{
    METRIC_CONSUME_MS, METRIC_EARLY_TOTAL, METRIC_PURGE_FILES_TOTAL, METRIC_PURGE_URLS_TOTAL,
    METRIC_SWEEP_EVICTED_TOTAL, METRIC_SWEEP_MS, METRIC_WRITE_MS, METRIC_WRITE_TOTAL,
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

/// Register descriptions for every engine metric. Safe to call repeatedly.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_EARLY_TOTAL,
            Unit::Count,
            "Early-serve lookups, labelled by result (hit, miss, bypass, not_modified)."
        );
        describe_counter!(
            METRIC_WRITE_TOTAL,
            Unit::Count,
            "Snapshot variant writes, labelled by variant and result."
        );
        describe_histogram!(
            METRIC_WRITE_MS,
            Unit::Milliseconds,
            "Snapshot capture latency in milliseconds."
        );
        describe_counter!(
            METRIC_PURGE_URLS_TOTAL,
            Unit::Count,
            "URLs processed by invalidation."
        );
        describe_counter!(
            METRIC_PURGE_FILES_TOTAL,
            Unit::Count,
            "Snapshot files removed by invalidation."
        );
        describe_histogram!(
            METRIC_CONSUME_MS,
            Unit::Milliseconds,
            "Change event consumption latency in milliseconds."
        );
        describe_counter!(
            METRIC_SWEEP_EVICTED_TOTAL,
            Unit::Count,
            "Snapshot files evicted by the quota sweep."
        );
        describe_histogram!(
            METRIC_SWEEP_MS,
            Unit::Milliseconds,
            "Quota sweep latency in milliseconds."
        );
    });
}

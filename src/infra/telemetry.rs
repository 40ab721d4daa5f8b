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

/// Register descriptions for every metric the crate emits. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "journeyhub_query_fetch_total",
            Unit::Count,
            "Total number of settled query fetches, labelled by outcome."
        );
        describe_histogram!(
            "journeyhub_query_fetch_ms",
            Unit::Milliseconds,
            "Query fetch latency including retries in milliseconds."
        );
        describe_counter!(
            "journeyhub_query_retry_total",
            Unit::Count,
            "Total number of query fetch retries."
        );
        describe_counter!(
            "journeyhub_query_dedup_total",
            Unit::Count,
            "Total number of fetches answered by the cache or an in-flight request."
        );
        describe_counter!(
            "journeyhub_mutation_total",
            Unit::Count,
            "Total number of mutations, labelled by outcome."
        );
        describe_counter!(
            "journeyhub_cache_evict_total",
            Unit::Count,
            "Total number of cache entries evicted due to capacity."
        );
        describe_gauge!(
            "journeyhub_cache_event_queue_len",
            Unit::Count,
            "Current number of pending cache events in the queue."
        );
        describe_histogram!(
            "journeyhub_cache_consume_ms",
            Unit::Milliseconds,
            "Cache consumption latency in milliseconds."
        );
    });
}

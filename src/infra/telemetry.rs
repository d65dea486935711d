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

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "stampede_cache_hit_total",
            Unit::Count,
            "Total number of observations served from the cache."
        );
        describe_counter!(
            "stampede_cache_miss_total",
            Unit::Count,
            "Total number of observations that found no cached value."
        );
        describe_counter!(
            "stampede_coalesced_total",
            Unit::Count,
            "Total number of requests attached to an already running production."
        );
        describe_counter!(
            "stampede_production_started_total",
            Unit::Count,
            "Total number of productions started."
        );
        describe_counter!(
            "stampede_production_failed_total",
            Unit::Count,
            "Total number of productions that failed or panicked."
        );
        describe_histogram!(
            "stampede_production_ms",
            Unit::Milliseconds,
            "Production latency in milliseconds."
        );
        describe_counter!(
            "stampede_backoff_suppressed_total",
            Unit::Count,
            "Total number of observations answered with a recent failure instead of a production."
        );
        describe_counter!(
            "stampede_revalidation_total",
            Unit::Count,
            "Total number of revalidation callbacks invoked."
        );
        describe_counter!(
            "stampede_mutation_total",
            Unit::Count,
            "Total number of mutations written to the cache."
        );
        describe_gauge!(
            "stampede_inflight",
            Unit::Count,
            "Current number of running productions."
        );
    });
}

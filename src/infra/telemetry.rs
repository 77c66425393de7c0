use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::metric_names::{
    METRIC_CACHE_HIT_TOTAL, METRIC_CACHE_MISS_TOTAL, METRIC_ERRORS_TOTAL,
    METRIC_OFFLINE_SERVED_TOTAL, METRIC_REQUEST_MS, METRIC_REQUESTS_TOTAL,
    METRIC_SYNC_ATTEMPT_TOTAL,
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

/// Register descriptions for every metric the engine emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_REQUESTS_TOTAL,
            Unit::Count,
            "Total number of intercepted requests, by strategy."
        );
        describe_counter!(
            METRIC_CACHE_HIT_TOTAL,
            Unit::Count,
            "Intercepted requests answered from a partition."
        );
        describe_counter!(
            METRIC_CACHE_MISS_TOTAL,
            Unit::Count,
            "Intercepted requests answered from the network."
        );
        describe_counter!(
            METRIC_OFFLINE_SERVED_TOTAL,
            Unit::Count,
            "Responses produced while the network was unreachable."
        );
        describe_counter!(
            METRIC_ERRORS_TOTAL,
            Unit::Count,
            "Intercepted requests that ended with no response."
        );
        describe_histogram!(
            METRIC_REQUEST_MS,
            Unit::Milliseconds,
            "Intercepted request latency in milliseconds."
        );
        describe_counter!(
            METRIC_SYNC_ATTEMPT_TOTAL,
            Unit::Count,
            "Background sync attempts, by outcome."
        );
    });
}

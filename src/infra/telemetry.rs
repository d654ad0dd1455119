use std::sync::Once;

use metrics::{Unit, describe_counter};
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
        LogFormat::Json => fmt::layer().json().with_current_span(true).boxed(),
        LogFormat::Compact => fmt::layer().compact().boxed(),
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

/// Register descriptions for the counters the cache emits.
///
/// Runs once per process; safe to call before or after a recorder is set.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "outcache_hit_total",
            Unit::Count,
            "Total number of requests served from the output cache."
        );
        describe_counter!(
            "outcache_miss_total",
            Unit::Count,
            "Total number of lookups that found no stored entry."
        );
        describe_counter!(
            "outcache_store_total",
            Unit::Count,
            "Total number of responses written to the cache provider."
        );
        describe_counter!(
            "outcache_skip_total",
            Unit::Count,
            "Total number of responses not cached, labelled by reason."
        );
        describe_counter!(
            "outcache_provider_error_total",
            Unit::Count,
            "Total number of failed cache provider operations, labelled by op."
        );
        describe_counter!(
            "outcache_evict_total",
            Unit::Count,
            "Total number of in-memory entries evicted due to capacity."
        );
    });
}

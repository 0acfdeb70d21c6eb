//! Logging and event-driven metrics.
//!
//! Structured logging goes through `tracing` with an EnvFilter built from
//! the configured level. Metrics are fire-and-forget events pushed over a
//! channel from the packet path and aggregated by a dedicated task that
//! logs periodic summaries; the hot path never blocks on telemetry.

pub mod metrics;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use crate::config::TelemetryConfig;

pub use metrics::{record_metric, MetricsEvent, MetricsHandle};

/// Initialize logging and start the metrics aggregation task.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<MetricsHandle> {
    let filter = EnvFilter::try_new(&config.log_level)
        .with_context(|| format!("invalid log level {:?}", config.log_level))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    // Ignore AlreadyInit so tests can call through this path repeatedly.
    let result = if config.log_format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already initialized");
    }

    Ok(metrics::start_metrics_task(config.metrics_interval_secs))
}

// packages/uplink/src/observability/mod.rs
//! Logging, metrics and pipeline health counters
//!
//! - **init_tracing**: `tracing-subscriber` with env filter (JSON output when
//!   `UPLINK_LOG_JSON` is set)
//! - **init_metrics**: Prometheus recorder for the `metrics` facade
//! - **Telemetry**: in-process counters mirrored to `metrics`

pub mod telemetry;

pub use telemetry::{Telemetry, TelemetryEvent, TelemetrySnapshot};

use crate::utils::errors::{PipelineError, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable switching log output to JSON lines
pub const LOG_JSON_ENV: &str = "UPLINK_LOG_JSON";

/// Install the global tracing subscriber
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    let installed = if std::env::var_os(LOG_JSON_ENV).is_some() {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };

    installed.map_err(|e| PipelineError::ConfigError(format!("Failed to install tracing: {}", e)))
}

/// Install the Prometheus recorder and return its render handle
pub fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| PipelineError::ConfigError(format!("Failed to install metrics recorder: {}", e)))
}

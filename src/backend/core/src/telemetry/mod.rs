//! Telemetry: logging and metrics initialization.
//!
//! Sets up the `tracing` subscriber (env-filtered, optionally JSON) and
//! installs the Prometheus metrics recorder. Call once at startup; the
//! returned handle renders the exposition text for `GET /metrics`.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;

use crate::config::ObservabilityConfig;

/// Initialize logging and metrics.
///
/// `RUST_LOG` overrides the configured log level when set.
pub fn init_telemetry(config: &ObservabilityConfig) -> anyhow::Result<PrometheusHandle> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if config.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(handle)
}

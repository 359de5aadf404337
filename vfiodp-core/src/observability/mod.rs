//! Observability infrastructure: tracing and metrics.
//!
//! Call [`init`] once at startup, before spawning any plugin tasks.

use crate::error::{DevicePluginError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod metrics;

/// Build the log filter. `RUST_LOG` wins over the configured level.
fn env_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize the global tracing subscriber and, when `metrics_port` is set,
/// the Prometheus exporter.
pub fn init(log_level: &str, metrics_port: Option<u16>) -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter(log_level))
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true))
        .try_init()
        .map_err(|e| DevicePluginError::Internal(format!("tracing already initialized: {}", e)))?;

    match metrics_port {
        Some(port) => {
            PrometheusBuilder::new()
                .with_http_listener(([0, 0, 0, 0], port))
                .install()
                .map_err(|e| DevicePluginError::Internal(format!("metrics exporter: {}", e)))?;
            tracing::info!(port, "Prometheus metrics exporter listening");
        }
        None => tracing::info!("Metrics exporter disabled (no metrics_port configured)"),
    }

    metrics::register_core_metrics();
    Ok(())
}

//! Telemetry: structured logging, optional OTLP trace export and Prometheus metrics.
//!
//! # Example
//!
//! ```rust,no_run
//! use rollup_core::config::ObservabilityConfig;
//! use rollup_core::telemetry::init_telemetry;
//!
//! # fn main() -> anyhow::Result<()> {
//! let telemetry = init_telemetry(&ObservabilityConfig::default(), "rollup-server")?;
//! // ... run ...
//! telemetry.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod metrics;

use opentelemetry_otlp::WithExportConfig;
use std::str::FromStr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::ObservabilityConfig;

pub use self::metrics::{init_metrics, register_metric_descriptions};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
    Compact,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            other => Err(format!("unknown log format: {}", other)),
        }
    }
}

/// Initialize logging, tracing export and metrics. Call once at start-up.
///
/// `RUST_LOG` takes precedence over the configured log level.
pub fn init_telemetry(config: &ObservabilityConfig, service_name: &str) -> anyhow::Result<TelemetryHandle> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.log_level))?;
    let format: LogFormat = config.log_format.parse().map_err(anyhow::Error::msg)?;

    let fmt_layer = match format {
        LogFormat::Json => fmt::layer().json().with_current_span(true).boxed(),
        LogFormat::Pretty => fmt::layer().pretty().boxed(),
        LogFormat::Compact => fmt::layer().compact().boxed(),
    };

    let otel_layer = match config.otlp_endpoint.as_deref() {
        Some(endpoint) => {
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint),
                )
                .with_trace_config(
                    opentelemetry_sdk::trace::config()
                        .with_resource(opentelemetry_sdk::Resource::new(vec![
                            opentelemetry::KeyValue::new("service.name", service_name.to_string()),
                            opentelemetry::KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                        ])),
                )
                .install_batch(opentelemetry_sdk::runtime::Tokio)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };
    let tracing_enabled = otel_layer.is_some();

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .with(otel_layer)
        .try_init()?;

    let metrics_enabled = match config.metrics_endpoint.as_deref() {
        Some(endpoint) => {
            init_metrics(endpoint)?;
            true
        }
        None => false,
    };

    tracing::info!(
        service_name,
        log_format = ?format,
        tracing_enabled,
        metrics_enabled,
        "Telemetry initialized"
    );

    Ok(TelemetryHandle { tracing_enabled })
}

/// Handle for managing telemetry lifecycle.
pub struct TelemetryHandle {
    tracing_enabled: bool,
}

impl TelemetryHandle {
    /// Flush pending spans.
    pub fn shutdown(self) {
        if self.tracing_enabled {
            opentelemetry::global::shutdown_tracer_provider();
        }
        tracing::info!("Telemetry shutdown complete");
    }
}

//! Brivas Telemetry
//!
//! Unified observability: structured logs, in-process metrics, and
//! distributed tracing via OpenTelemetry.

mod config;
mod tracing_setup;
mod metrics;

pub use config::TelemetryConfig;
pub use tracing_setup::init_tracing;
pub use metrics::{Counter, Histogram, HistogramSummary};

/// Initialize all telemetry for a service
pub fn init(service_name: &str) -> Result<TelemetryGuard, TelemetryError> {
    init_with(service_name, &TelemetryConfig::from_env())
}

/// Initialize telemetry with an explicit configuration
pub fn init_with(service_name: &str, config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    init_tracing(service_name, config)?;
    Ok(TelemetryGuard {
        otlp: config.otlp_endpoint.is_some(),
    })
}

/// Guard that flushes and shuts down span export on drop
pub struct TelemetryGuard {
    otlp: bool,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if self.otlp {
            opentelemetry::global::shutdown_tracer_provider();
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Tracing initialization failed: {0}")]
    TracingInit(String),

    #[error("OTLP configuration error: {0}")]
    OtlpConfig(String),
}

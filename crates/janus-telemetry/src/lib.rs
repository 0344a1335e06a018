//! Observability bootstrap for the Janus gateway.
//!
//! Three one-shot initialisers, each guarded so repeated calls (tests,
//! embedded use) are harmless:
//!
//! - [`logging::init_logging`], structured logs via `tracing-subscriber`,
//!   JSON in production, pretty for development.
//! - [`metrics::init_metrics`], installs the Prometheus recorder and
//!   describes the gateway metric set; the rendered exposition text is
//!   served by the proxy's `/metrics` route.
//! - [`trace::init_tracing`], installs the OTLP tracer provider and the
//!   W3C trace-context + baggage propagators used by the tracing
//!   middleware.

pub mod logging;
pub mod metrics;
pub mod trace;

use thiserror::Error;

/// Result alias for telemetry initialisation.
pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Errors during telemetry bootstrap.
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// Logging subscriber could not be installed.
    #[error("logging init failed: {0}")]
    LoggingInit(String),

    /// Prometheus recorder could not be installed.
    #[error("metrics init failed: {0}")]
    MetricsInit(String),

    /// Tracer provider could not be built.
    #[error("tracing init failed: {0}")]
    TracingInit(String),
}

//! Prometheus metrics for the gateway.
//!
//! The data-path crates record through the `metrics` facade; this module
//! installs the Prometheus recorder once and describes the gateway metric
//! set. Names keep the `go_gateway_*` prefix the original deployment
//! dashboards were built against.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `go_gateway_requests_code_total` | Counter | `protocol`, `method`, `path`, `code`, `service`, `basePath` |
//! | `go_gateway_requests_duration_seconds` | Histogram | `protocol`, `method`, `path`, `service`, `basePath` |
//! | `go_gateway_requests_tx_bytes` | Counter | same as duration |
//! | `go_gateway_requests_rx_bytes` | Counter | same as duration |
//! | `go_gateway_requests_retry_state` | Counter | duration labels + `success` |
//! | `go_gateway_client_redirect_total` | Counter | duration labels |
//! | `go_gateway_failed_middleware_create` | Counter | `name`, `required` |

use std::sync::OnceLock;

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

use crate::{TelemetryError, TelemetryResult};

/// Histogram buckets for request duration, in seconds.
pub const DURATION_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0];

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder and describe the gateway metrics.
///
/// Safe to call more than once; later calls reuse the first handle.
///
/// # Errors
///
/// Returns `TelemetryError::MetricsInit` when a different recorder is
/// already installed globally.
pub fn init_metrics() -> TelemetryResult<PrometheusHandle> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("go_gateway_requests_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?
        .install_recorder()
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;

    describe_counter!(
        "go_gateway_requests_code_total",
        "The total number of processed requests"
    );
    describe_histogram!(
        "go_gateway_requests_duration_seconds",
        "Requests duration(sec)."
    );
    describe_counter!("go_gateway_requests_tx_bytes", "Total sent connection bytes");
    describe_counter!(
        "go_gateway_requests_rx_bytes",
        "Total received connection bytes"
    );
    describe_counter!("go_gateway_requests_retry_state", "Total request retries");
    describe_counter!(
        "go_gateway_client_redirect_total",
        "The total number of client redirect"
    );
    describe_counter!(
        "go_gateway_failed_middleware_create",
        "The total number of failed middleware create"
    );

    let _ = METRICS_HANDLE.set(handle.clone());
    Ok(handle)
}

/// The installed recorder handle, if [`init_metrics`] has run.
///
/// The proxy uses this to render the `/metrics` exposition text.
#[must_use]
pub fn handle() -> Option<PrometheusHandle> {
    METRICS_HANDLE.get().cloned()
}

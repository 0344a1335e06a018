//! OpenTelemetry tracer provider setup.
//!
//! Installs an OTLP span exporter and the propagator pair the gateway
//! injects into upstream requests: W3C `TraceContext` plus `Baggage`.
//! Span creation itself happens in the tracing middleware; this module
//! only owns the process-wide provider.

use std::sync::OnceLock;

use opentelemetry::propagation::TextMapCompositePropagator;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use opentelemetry_sdk::trace::{Sampler, TracerProvider};
use opentelemetry_sdk::Resource;

use crate::{TelemetryError, TelemetryResult};

/// Tracing configuration.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Whether tracing is enabled at all.
    pub enabled: bool,
    /// OTLP endpoint, e.g. `http://localhost:4317`.
    pub otlp_endpoint: String,
    /// Export without TLS even when the endpoint says `https`.
    pub insecure: bool,
    /// Service name attached to every span.
    pub service_name: String,
    /// Sampling ratio in `[0.0, 1.0]`; `1.0` samples everything.
    pub sample_ratio: f64,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            otlp_endpoint: "http://localhost:4317".to_string(),
            insecure: false,
            service_name: "gateway".to_string(),
            sample_ratio: 1.0,
        }
    }
}

/// The endpoint the exporter actually dials. The OTLP transport decides
/// TLS from the URL scheme, so `insecure` downgrades `https` to `http`.
fn export_endpoint(config: &TracingConfig) -> String {
    if config.insecure {
        if let Some(rest) = config.otlp_endpoint.strip_prefix("https://") {
            return format!("http://{rest}");
        }
    }
    config.otlp_endpoint.clone()
}

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Install the global tracer provider and propagators.
///
/// One-shot: later calls return `Ok(None)` without reconfiguring.
///
/// # Errors
///
/// Returns `TelemetryError::TracingInit` when the exporter cannot be built.
pub fn init_tracing(config: &TracingConfig) -> TelemetryResult<Option<TracerProvider>> {
    if !config.enabled || INSTALLED.get().is_some() {
        return Ok(None);
    }

    let resource = Resource::new([KeyValue::new(
        opentelemetry_semantic_conventions::attribute::SERVICE_NAME,
        config.service_name.clone(),
    )]);

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(export_endpoint(config))
        .build()
        .map_err(|e| TelemetryError::TracingInit(e.to_string()))?;

    let sampler = if config.sample_ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if config.sample_ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(config.sample_ratio)
    };

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_sampler(sampler)
        .with_resource(resource)
        .build();

    global::set_tracer_provider(provider.clone());
    global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
        Box::new(BaggagePropagator::new()),
        Box::new(TraceContextPropagator::new()),
    ]));

    let _ = INSTALLED.set(());
    Ok(Some(provider))
}

/// Flush and shut down a provider returned by [`init_tracing`].
pub fn shutdown_tracing(provider: &TracerProvider) {
    for result in provider.force_flush() {
        if let Err(err) = result {
            eprintln!("trace flush failed: {err}");
        }
    }
    if let Err(err) = provider.shutdown() {
        eprintln!("trace shutdown failed: {err}");
    }
}

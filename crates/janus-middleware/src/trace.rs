//! Per-attempt client tracing middleware.
//!
//! Starts a client-kind span named `"<METHOD> <path>"` around every
//! upstream round trip (one span per attempt, not per inbound request),
//! injects W3C `traceparent` + `baggage` into the outbound headers and
//! records the outcome on the span. The first factory invocation installs
//! the process-wide tracer provider.

use std::sync::Arc;

use http::{HeaderMap, Request};
use opentelemetry::propagation::Injector;
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{global, Context, KeyValue};
use serde::Deserialize;

use janus_telemetry::trace::{init_tracing, TracingConfig};

use crate::registry::{self, Factory, MiddlewareError};
use crate::request::RequestOptions;
use crate::transport::{BoxMiddleware, BoxTransport, FnMiddleware, RequestBody, TransportFn};

const TRACER_NAME: &str = "gateway";

/// Request-bag key under which the proxy stores the client IP.
pub const CLIENT_IP_KEY: &str = "client_ip";

/// Options blob for the tracing middleware.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TraceOptions {
    /// OTLP endpoint the provider exports to.
    pub http_endpoint: String,
    /// Skip TLS towards the collector.
    pub insecure: bool,
    /// Sampling ratio; absent samples everything.
    pub sample_ratio: Option<f64>,
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self {
            http_endpoint: "http://localhost:4317".to_string(),
            insecure: false,
            sample_ratio: None,
        }
    }
}

/// Register the `tracing` factory with the global registry.
pub fn register() {
    registry::register("tracing", factory());
}

fn factory() -> Factory {
    Box::new(|cfg| {
        let options: TraceOptions = match &cfg.options {
            Some(raw) => serde_json::from_value(raw.clone()).map_err(|e| {
                MiddlewareError::InvalidOptions { name: cfg.name.clone(), message: e.to_string() }
            })?,
            None => TraceOptions::default(),
        };
        let config = TracingConfig {
            enabled: true,
            otlp_endpoint: options.http_endpoint.clone(),
            insecure: options.insecure,
            service_name: TRACER_NAME.to_string(),
            sample_ratio: options.sample_ratio.unwrap_or(1.0),
        };
        if let Err(err) = init_tracing(&config) {
            return Err(MiddlewareError::CreateFailed {
                name: cfg.name.clone(),
                message: err.to_string(),
            });
        }
        Ok(middleware())
    })
}

/// Build the span-per-attempt middleware.
#[must_use]
pub fn middleware() -> BoxMiddleware {
    Arc::new(FnMiddleware(|next: BoxTransport| {
        Arc::new(TransportFn(move |mut req: Request<RequestBody>| {
            let next = next.clone();
            async move {
                let tracer = global::tracer(TRACER_NAME);
                let method = req.method().as_str().to_string();
                let path = req.uri().path().to_string();
                let peer_ip = RequestOptions::from_request(&req)
                    .and_then(|o| o.value::<String>(CLIENT_IP_KEY))
                    .unwrap_or_default();

                let span = tracer
                    .span_builder(format!("{method} {path}"))
                    .with_kind(SpanKind::Client)
                    .with_attributes([
                        KeyValue::new("http.method", method),
                        KeyValue::new("http.target", path),
                        KeyValue::new("net.peer.ip", peer_ip),
                    ])
                    .start(&tracer);
                let cx = Context::current_with_span(span);
                global::get_text_map_propagator(|propagator| {
                    propagator.inject_context(&cx, &mut HeaderInjector(req.headers_mut()));
                });

                let result = next.round_trip(req).await;
                let span = cx.span();
                match &result {
                    Ok(resp) => {
                        span.set_attribute(KeyValue::new(
                            "http.status_code",
                            i64::from(resp.status().as_u16()),
                        ));
                        span.set_status(Status::Ok);
                    }
                    Err(err) => {
                        span.set_status(Status::error(err.to_string()));
                    }
                }
                span.end();
                result
            }
        })) as BoxTransport
    }))
}

struct HeaderInjector<'a>(&'a mut HeaderMap);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        if let (Ok(name), Ok(value)) = (
            key.parse::<http::HeaderName>(),
            http::HeaderValue::from_str(&value),
        ) {
            self.0.insert(name, value);
        }
    }
}

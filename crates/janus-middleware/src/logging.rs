//! Upstream access-log middleware.
//!
//! Emits one structured log line per upstream round trip: method, path,
//! selected backend, status (or error) and elapsed time.

use std::sync::Arc;
use std::time::Instant;

use http::Request;

use crate::registry::{self, Factory};
use crate::request::RequestOptions;
use crate::transport::{BoxMiddleware, BoxTransport, FnMiddleware, RequestBody, TransportFn};

/// Register the `logging` factory with the global registry.
pub fn register() {
    registry::register("logging", factory());
}

fn factory() -> Factory {
    Box::new(|_cfg| Ok(middleware()))
}

/// Build the access-log middleware.
#[must_use]
pub fn middleware() -> BoxMiddleware {
    Arc::new(FnMiddleware(|next: BoxTransport| {
        Arc::new(TransportFn(move |req: Request<RequestBody>| {
            let next = next.clone();
            async move {
                let method = req.method().clone();
                let path = req.uri().path().to_string();
                let options = RequestOptions::from_request(&req);
                let start = Instant::now();
                let result = next.round_trip(req).await;
                let elapsed_ms = start.elapsed().as_secs_f64() * 1_000.0;
                let backend = options
                    .as_ref()
                    .and_then(|o| o.current_node())
                    .unwrap_or_default();
                match &result {
                    Ok(resp) => tracing::info!(
                        source = "accesslog",
                        method = %method,
                        path = %path,
                        backend = %backend,
                        code = resp.status().as_u16(),
                        elapsed_ms,
                        "upstream request"
                    ),
                    Err(err) => tracing::error!(
                        source = "accesslog",
                        method = %method,
                        path = %path,
                        backend = %backend,
                        error = %err,
                        elapsed_ms,
                        "upstream request failed"
                    ),
                }
                result
            }
        })) as BoxTransport
    }))
}

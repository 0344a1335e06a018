//! Debug inspection surface.
//!
//! Debuggables register a handler under `/debug/<name>`; [`handle`] routes
//! debug traffic to them by longest prefix. The whole surface rejects
//! forwarded traffic (any `X-Forwarded-For` header) so it is only
//! reachable from direct callers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use http::{Request, Response, StatusCode};
use hyper::body::Incoming;

use janus_router::{BoxHandler, HandlerFuture, RouteBody};

const DEBUG_PREFIX: &str = "/debug";

fn registry() -> &'static Mutex<HashMap<String, BoxHandler>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, BoxHandler>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Mount a debuggable's handler under `/debug/<name>`.
pub fn register(name: &str, handler: BoxHandler) {
    let path = format!("{DEBUG_PREFIX}/{name}");
    tracing::info!(path = %path, "register debug");
    registry()
        .lock()
        .expect("debug registry poisoned")
        .insert(path, handler);
}

/// Whether this request path belongs to the debug surface.
#[must_use]
pub fn is_debug_path(path: &str) -> bool {
    path.starts_with(DEBUG_PREFIX)
}

/// Serve one debug request.
pub fn handle(req: Request<Incoming>) -> HandlerFuture {
    Box::pin(async move {
        if req.headers().contains_key("x-forwarded-for") {
            return simple(StatusCode::FORBIDDEN, "Forbidden");
        }
        let path = req.uri().path().to_string();
        if path == "/debug/ping" {
            return simple(StatusCode::OK, "");
        }
        let handler = {
            let registry = registry().lock().expect("debug registry poisoned");
            registry
                .iter()
                .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
                .max_by_key(|(prefix, _)| prefix.len())
                .map(|(_, handler)| handler.clone())
        };
        match handler {
            Some(handler) => handler(req).await,
            None => simple(StatusCode::NOT_FOUND, "404 page not found"),
        }
    })
}

/// Debug handler for the shared service watcher:
/// `/debug/watcher/nodes?service=…` dumps the cached instance set,
/// `/debug/watcher/appliers?service=…` the subscriber ids.
#[must_use]
pub fn watcher_debug_handler() -> BoxHandler {
    Arc::new(|req: Request<Incoming>| {
        Box::pin(async move {
            let service = query_param(req.uri().query(), "service").unwrap_or_default();
            let watcher = janus_client::watch::global();
            match req.uri().path() {
                "/debug/watcher/nodes" => {
                    json(&watcher.cached_instances(&service).unwrap_or_default())
                }
                "/debug/watcher/appliers" => json(&watcher.subscriber_ids(&service)),
                _ => simple(StatusCode::NOT_FOUND, "404 page not found"),
            }
        })
    })
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

fn simple(status: StatusCode, body: &str) -> Response<RouteBody> {
    use http_body_util::BodyExt;
    Response::builder()
        .status(status)
        .body(
            http_body_util::Full::new(bytes::Bytes::from(body.to_string()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("static response")
}

fn json<T: serde::Serialize>(value: &T) -> Response<RouteBody> {
    use http_body_util::BodyExt;
    match serde_json::to_vec(value) {
        Ok(encoded) => Response::builder()
            .status(StatusCode::OK)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(
                http_body_util::Full::new(bytes::Bytes::from(encoded))
                    .map_err(|never| match never {})
                    .boxed(),
            )
            .expect("static response"),
        Err(err) => simple(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

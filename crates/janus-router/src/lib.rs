//! Request router for the Janus gateway.
//!
//! Routes are registered per config generation and the whole router is
//! replaced atomically on reload; an installed router is immutable. Every
//! dispatch is tracked in a pending-request wait group so a superseded
//! router can drain before its endpoints' resources are closed.

mod clean;
mod pattern;

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::uri::PathAndQuery;
use http::{Method, Request, Response, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use serde::Serialize;
use tokio::sync::Notify;

use janus_core::{GatewayError, GatewayResult};

pub use clean::clean_path;
pub use pattern::PathPattern;

/// Response body produced by route handlers.
pub type RouteBody = BoxBody<Bytes, GatewayError>;

/// Boxed handler future.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Response<RouteBody>> + Send>>;

/// A route handler: the per-endpoint pipeline built by the proxy.
pub type BoxHandler = Arc<dyn Fn(Request<Incoming>) -> HandlerFuture + Send + Sync>;

/// Resource teardown for one route, run once on router close.
pub type Closer = Box<dyn FnOnce() + Send>;

/// Whether `ENABLE_STRICT_SLASH` marks trailing slashes significant.
pub fn strict_slash_enabled() -> bool {
    static STRICT: std::sync::OnceLock<bool> = std::sync::OnceLock::new();
    *STRICT.get_or_init(|| {
        std::env::var("ENABLE_STRICT_SLASH")
            .ok()
            .and_then(|v| v.parse::<bool>().ok())
            .unwrap_or(false)
    })
}

struct RouteEntry {
    pattern: PathPattern,
    /// `None` matches any method.
    methods: Option<HashSet<Method>>,
    host: Option<String>,
    handler: BoxHandler,
}

/// One immutable routing table plus its drain/teardown state.
pub struct Router {
    routes: Vec<RouteEntry>,
    not_found: BoxHandler,
    method_not_allowed: BoxHandler,
    pending: Arc<Pending>,
    closers: Mutex<Vec<Closer>>,
}

impl Router {
    /// An empty router with the given fallback handlers.
    #[must_use]
    pub fn new(not_found: BoxHandler, method_not_allowed: BoxHandler) -> Self {
        Self {
            routes: Vec::new(),
            not_found,
            method_not_allowed,
            pending: Arc::new(Pending::default()),
            closers: Mutex::new(Vec::new()),
        }
    }

    /// Register a handler for `(pattern, method, host)`.
    ///
    /// An empty or `*` method matches anything; a concrete method also
    /// registers `OPTIONS`. The closer runs once when this router is
    /// superseded and drained.
    pub fn handle(
        &mut self,
        pattern: &str,
        method: &str,
        host: Option<&str>,
        handler: BoxHandler,
        closer: Closer,
    ) -> GatewayResult<()> {
        let compiled = PathPattern::parse(pattern, strict_slash_enabled())?;
        let methods = if method.is_empty() || method == "*" {
            None
        } else {
            let parsed: Method = method.parse().map_err(|_| {
                GatewayError::config(format!("invalid method {method:?} for {pattern:?}"))
            })?;
            Some(HashSet::from([parsed, Method::OPTIONS]))
        };
        self.routes.push(RouteEntry {
            pattern: compiled,
            methods,
            host: host.filter(|h| !h.is_empty()).map(str::to_string),
            handler,
        });
        self.closers.lock().expect("router closers poisoned").push(closer);
        Ok(())
    }

    /// Route one request.
    ///
    /// The path is cleaned before matching; a path-only match with the
    /// wrong method falls through to the 405 handler, no match at all to
    /// the 404 handler. The pending-request guard rides on the response
    /// body, so draining waits for the full copy, not just the handler.
    pub async fn dispatch(&self, mut req: Request<Incoming>) -> Response<RouteBody> {
        let guard = self.pending.enter();
        rewrite_clean_path(&mut req);
        let path = req.uri().path().to_string();
        let host = request_host(&req);

        let mut path_matched = false;
        let mut matched: Option<&RouteEntry> = None;
        for entry in &self.routes {
            if let Some(required) = &entry.host {
                if !host.eq_ignore_ascii_case(required) {
                    continue;
                }
            }
            if !entry.pattern.matches(&path) {
                continue;
            }
            match &entry.methods {
                Some(methods) if !methods.contains(req.method()) => {
                    path_matched = true;
                }
                _ => {
                    matched = Some(entry);
                    break;
                }
            }
        }
        let response = match matched {
            Some(entry) => (entry.handler)(req).await,
            None if path_matched => (self.method_not_allowed)(req).await,
            None => (self.not_found)(req).await,
        };
        response.map(|body| GuardedBody { body, _guard: guard }.boxed())
    }

    /// Wait (bounded by `timeout`) for in-flight requests, then run every
    /// registered closer exactly once.
    pub async fn sync_close(&self, timeout: Duration) {
        if tokio::time::timeout(timeout, self.pending.wait()).await.is_err() {
            tracing::warn!("timed out waiting for requests to complete, forcing close");
        }
        let closers: Vec<Closer> = {
            let mut guard = self.closers.lock().expect("router closers poisoned");
            guard.drain(..).collect()
        };
        for closer in closers {
            closer();
        }
    }

    /// Number of requests currently inside [`Router::dispatch`].
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.pending.count.load(Ordering::SeqCst)
    }

    /// Snapshot of the routing table for the debug surface.
    #[must_use]
    pub fn inspect(&self) -> Vec<RouterInspect> {
        self.routes
            .iter()
            .map(|entry| RouterInspect {
                path_template: entry.pattern.template().to_string(),
                path_regexp: entry.pattern.regex().unwrap_or("").to_string(),
                methods: entry
                    .methods
                    .as_ref()
                    .map(|m| {
                        let mut list: Vec<String> =
                            m.iter().map(|m| m.as_str().to_string()).collect();
                        list.sort();
                        list
                    })
                    .unwrap_or_default(),
                host: entry.host.clone(),
            })
            .collect()
    }
}

/// One row of the routing-table dump.
#[derive(Debug, Clone, Serialize)]
pub struct RouterInspect {
    /// Registered pattern.
    pub path_template: String,
    /// Compiled regex, empty for exact/prefix patterns.
    pub path_regexp: String,
    /// Allowed methods; empty means any.
    pub methods: Vec<String>,
    /// Host constraint.
    pub host: Option<String>,
}

fn request_host<B>(req: &Request<B>) -> String {
    if let Some(host) = req.uri().host() {
        return host.to_string();
    }
    req.headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h).to_string())
        .unwrap_or_default()
}

fn rewrite_clean_path<B>(req: &mut Request<B>) {
    let cleaned = clean_path(req.uri().path());
    if cleaned == req.uri().path() {
        return;
    }
    let mut parts = req.uri().clone().into_parts();
    let pq = match req.uri().query() {
        Some(query) => format!("{cleaned}?{query}"),
        None => cleaned,
    };
    if let Ok(pq) = pq.parse::<PathAndQuery>() {
        parts.path_and_query = Some(pq);
        if let Ok(uri) = Uri::from_parts(parts) {
            *req.uri_mut() = uri;
        }
    }
}

/// Pending-request wait group.
#[derive(Default)]
struct Pending {
    count: AtomicUsize,
    drained: Notify,
}

impl Pending {
    fn enter(self: &Arc<Self>) -> PendingGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        PendingGuard(self.clone())
    }

    async fn wait(&self) {
        loop {
            let drained = self.drained.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            drained.await;
        }
    }
}

struct PendingGuard(Arc<Pending>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

/// Carries the pending-request guard until the response body is fully
/// streamed (or abandoned).
struct GuardedBody {
    body: RouteBody,
    _guard: PendingGuard,
}

impl hyper::body::Body for GuardedBody {
    type Data = Bytes;
    type Error = GatewayError;

    fn poll_frame(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Result<hyper::body::Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.body).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.body.is_end_stream()
    }

    fn size_hint(&self) -> hyper::body::SizeHint {
        self.body.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Full};
    use std::sync::atomic::AtomicBool;

    fn text_handler(body: &'static str, status: u16) -> BoxHandler {
        Arc::new(move |_req| {
            Box::pin(async move {
                Response::builder()
                    .status(status)
                    .body(
                        Full::new(Bytes::from_static(body.as_bytes()))
                            .map_err(|never| match never {})
                            .boxed(),
                    )
                    .expect("static response")
            })
        })
    }

    fn test_router() -> Router {
        Router::new(text_handler("not found", 404), text_handler("method not allowed", 405))
    }

    fn noop_closer() -> Closer {
        Box::new(|| {})
    }

    /// Drive the dispatch path through a real hyper connection so the
    /// router sees `Incoming` bodies like it does in production.
    async fn status_for(router: &Arc<Router>, method: &str, path: &str) -> u16 {
        use hyper_util::rt::TokioIo;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let served = router.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let service = hyper::service::service_fn(move |req| {
                let served = served.clone();
                async move { Ok::<_, std::convert::Infallible>(served.dispatch(req).await) }
            });
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await;
        });

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (mut sender, conn) =
            hyper::client::conn::http1::handshake(TokioIo::new(stream)).await.unwrap();
        tokio::spawn(conn);
        let req = Request::builder()
            .method(method)
            .uri(path)
            .header(http::header::HOST, "example.com")
            .body(Full::new(Bytes::new()))
            .unwrap();
        sender.send_request(req).await.unwrap().status().as_u16()
    }

    #[tokio::test]
    async fn test_dispatch_matches_and_falls_back() {
        let mut router = test_router();
        router
            .handle("/echo", "GET", None, text_handler("echo", 200), noop_closer())
            .unwrap();
        let router = Arc::new(router);

        assert_eq!(status_for(&router, "GET", "/echo").await, 200);
        assert_eq!(status_for(&router, "POST", "/echo").await, 405);
        assert_eq!(status_for(&router, "GET", "/missing").await, 404);
        // OPTIONS is registered alongside the concrete method.
        assert_eq!(status_for(&router, "OPTIONS", "/echo").await, 200);
        // Redundant slashes are cleaned before matching.
        assert_eq!(status_for(&router, "GET", "//echo").await, 200);
    }

    #[tokio::test]
    async fn test_any_method_wildcard() {
        let mut router = test_router();
        router
            .handle("/any", "*", None, text_handler("any", 200), noop_closer())
            .unwrap();
        let router = Arc::new(router);
        assert_eq!(status_for(&router, "DELETE", "/any").await, 200);
        assert_eq!(status_for(&router, "PATCH", "/any").await, 200);
    }

    #[tokio::test]
    async fn test_host_constraint() {
        let mut router = test_router();
        router
            .handle(
                "/host-bound",
                "GET",
                Some("example.com"),
                text_handler("bound", 200),
                noop_closer(),
            )
            .unwrap();
        // The test client sends Host: example.com.
        assert_eq!(status_for(&Arc::new(router), "GET", "/host-bound").await, 200);

        let mut other = test_router();
        other
            .handle(
                "/host-bound",
                "GET",
                Some("other.example"),
                text_handler("bound", 200),
                noop_closer(),
            )
            .unwrap();
        assert_eq!(status_for(&Arc::new(other), "GET", "/host-bound").await, 404);
    }

    #[tokio::test]
    async fn test_sync_close_runs_closers_once() {
        let mut router = test_router();
        let closed = Arc::new(AtomicBool::new(false));
        let flag = closed.clone();
        router
            .handle(
                "/echo",
                "GET",
                None,
                text_handler("echo", 200),
                Box::new(move || {
                    assert!(!flag.swap(true, Ordering::SeqCst), "closer ran twice");
                }),
            )
            .unwrap();

        router.sync_close(Duration::from_millis(100)).await;
        assert!(closed.load(Ordering::SeqCst));
        // A second close finds no closers left.
        router.sync_close(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_inspect_dumps_routes() {
        let mut router = test_router();
        router
            .handle("/users/{id}", "GET", None, text_handler("u", 200), noop_closer())
            .unwrap();
        let dump = router.inspect();
        assert_eq!(dump.len(), 1);
        assert_eq!(dump[0].path_template, "/users/{id}");
        assert!(dump[0].path_regexp.contains("(?P<id>"));
        assert!(dump[0].methods.contains(&"GET".to_string()));
        let json = serde_json::to_string(&dump).unwrap();
        assert!(json.contains("path_template"));
    }

    #[tokio::test]
    async fn test_invalid_method_is_rejected() {
        let mut router = test_router();
        let result = router.handle(
            "/echo",
            "NOT A METHOD",
            None,
            text_handler("echo", 200),
            noop_closer(),
        );
        assert!(result.is_err());
    }
}

//! The proxy orchestrator: endpoint builds, the retry loop, atomic router
//! swaps.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode, Version};
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, Incoming};
use metrics::{counter, histogram};

use janus_client::{BuildContext, ClientFactory};
use janus_core::config::{Endpoint, Gateway, MiddlewareConfig, Protocol};
use janus_core::error::grpc_code_for_status;
use janus_core::net::ClientAddr;
use janus_core::selector::DoneInfo;
use janus_core::{GatewayError, GatewayResult};
use janus_middleware::{
    BoxMiddleware, BoxTransport, MetricsLabels, MiddlewareResult, RequestBody, RequestOptions,
    ResponseBody,
};
use janus_router::{BoxHandler, Closer, RouteBody, Router};

use crate::retry::{prepare_retry_strategy, retry_feature, RetryStrategy};
use crate::{breaker::SreBreaker, condition::judge_retry_required};

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const ROUTER_DRAIN_TIMEOUT: Duration = Duration::from_secs(120);
const BREAKER_SUCCESS_RATIO: f64 = 0.8;

/// Builds middlewares from config entries; usually the global registry's
/// `create` behind an `Arc`.
pub type MiddlewareFactory =
    Arc<dyn Fn(&MiddlewareConfig) -> MiddlewareResult<BoxMiddleware> + Send + Sync>;

/// The gateway proxy. Owns the active router and rebuilds it on every
/// configuration update.
pub struct Proxy {
    router: ArcSwap<Router>,
    client_factory: ClientFactory,
    middleware_factory: MiddlewareFactory,
}

impl Proxy {
    /// A proxy with an empty routing table installed.
    #[must_use]
    pub fn new(client_factory: ClientFactory, middleware_factory: MiddlewareFactory) -> Arc<Self> {
        Arc::new(Self {
            router: ArcSwap::from_pointee(new_router()),
            client_factory,
            middleware_factory,
        })
    }

    /// Handle one inbound request with panic isolation: a panicking
    /// endpoint pipeline turns into a 502 instead of tearing down the
    /// connection task.
    pub async fn handle(&self, req: Request<Incoming>) -> Response<RouteBody> {
        let router = self.router.load_full();
        match tokio::spawn(async move { router.dispatch(req).await }).await {
            Ok(response) => response,
            Err(join_err) => {
                let message = if join_err.is_panic() {
                    match join_err.into_panic().downcast::<String>() {
                        Ok(s) => *s,
                        Err(payload) => payload
                            .downcast::<&'static str>()
                            .map(|s| (*s).to_string())
                            .unwrap_or_else(|_| "unknown panic payload".to_string()),
                    }
                } else {
                    "request task canceled".to_string()
                };
                tracing::error!(panic = %message, "panic recovered while handling request");
                Response::builder()
                    .status(StatusCode::BAD_GATEWAY)
                    .body(empty_body())
                    .expect("static response")
            }
        }
    }

    /// Install a new configuration generation.
    ///
    /// Builds a complete new router first; any endpoint failure closes
    /// what was built and leaves the current router untouched. On success
    /// the router is swapped atomically and the predecessor drained in the
    /// background.
    pub async fn update(&self, build_ctx: Arc<BuildContext>, cfg: &Gateway) -> GatewayResult<()> {
        let mut router = new_router();
        register_metrics_route(&mut router)?;

        let result = self.build_all(&mut router, build_ctx, cfg).await;
        if let Err(err) = result {
            // Release whatever the partial build claimed.
            router.sync_close(Duration::ZERO).await;
            return Err(err);
        }

        let old = self.router.swap(Arc::new(router));
        tokio::spawn(async move {
            old.sync_close(ROUTER_DRAIN_TIMEOUT).await;
        });
        Ok(())
    }

    async fn build_all(
        &self,
        router: &mut Router,
        build_ctx: Arc<BuildContext>,
        cfg: &Gateway,
    ) -> GatewayResult<()> {
        for endpoint in &cfg.endpoints {
            let endpoint = Arc::new(endpoint.clone());
            let (handler, closer) = self
                .build_endpoint(build_ctx.clone(), endpoint.clone(), &cfg.middlewares)
                .await?;
            router.handle(
                &endpoint.path,
                &endpoint.method,
                endpoint.host.as_deref(),
                handler,
                closer,
            )?;
            tracing::info!(
                protocol = %endpoint.protocol,
                method = %endpoint.method,
                path = %endpoint.path,
                "build endpoint"
            );
        }
        Ok(())
    }

    fn build_middleware(
        &self,
        configs: &[MiddlewareConfig],
        mut tripper: BoxTransport,
        closers: &mut Vec<BoxMiddleware>,
    ) -> GatewayResult<BoxTransport> {
        for cfg in configs.iter().rev() {
            match (self.middleware_factory)(cfg) {
                Ok(mw) => {
                    tripper = mw.wrap(tripper);
                    closers.push(mw);
                }
                Err(err) if err.is_not_found() => {
                    tracing::error!(name = %cfg.name, "skip middleware that does not exist");
                }
                Err(err) => return Err(GatewayError::config(err.to_string())),
            }
        }
        Ok(tripper)
    }

    async fn build_endpoint(
        &self,
        build_ctx: Arc<BuildContext>,
        endpoint: Arc<Endpoint>,
        global_middlewares: &[MiddlewareConfig],
    ) -> GatewayResult<(BoxHandler, Closer)> {
        let client = (self.client_factory)(build_ctx, endpoint.clone()).await?;
        let mut middleware_closers: Vec<BoxMiddleware> = Vec::new();

        let built = (|| -> GatewayResult<(BoxTransport, RetryStrategy)> {
            let mut tripper: BoxTransport = client.clone();
            tripper =
                self.build_middleware(&endpoint.middlewares, tripper, &mut middleware_closers)?;
            tripper =
                self.build_middleware(global_middlewares, tripper, &mut middleware_closers)?;
            let strategy = prepare_retry_strategy(&endpoint)?;
            Ok((tripper, strategy))
        })();
        let (tripper, strategy) = match built {
            Ok(parts) => parts,
            Err(err) => {
                for mw in &middleware_closers {
                    mw.close();
                }
                client.close();
                return Err(err);
            }
        };

        let labels = MetricsLabels::new(&endpoint);
        let breaker = Arc::new(SreBreaker::new(BREAKER_SUCCESS_RATIO));
        let strategy = Arc::new(strategy);

        let handler: BoxHandler = Arc::new(move |req: Request<Incoming>| {
            let endpoint = endpoint.clone();
            let strategy = strategy.clone();
            let labels = labels.clone();
            let breaker = breaker.clone();
            let tripper = tripper.clone();
            Box::pin(async move {
                handle_endpoint_request(endpoint, strategy, labels, breaker, tripper, req).await
            })
        });

        let closer: Closer = Box::new(move || {
            for mw in &middleware_closers {
                mw.close();
            }
            client.close();
        });
        Ok((handler, closer))
    }

    /// Debug surface: `/debug/proxy/router/inspect`.
    #[must_use]
    pub fn debug_handler(self: &Arc<Self>) -> BoxHandler {
        let proxy = self.clone();
        Arc::new(move |req: Request<Incoming>| {
            let proxy = proxy.clone();
            Box::pin(async move {
                if req.uri().path() != "/debug/proxy/router/inspect" {
                    return Response::builder()
                        .status(StatusCode::NOT_FOUND)
                        .body(empty_body())
                        .expect("static response");
                }
                let inspect = proxy.router.load().inspect();
                json_response(&inspect)
            })
        })
    }
}

fn new_router() -> Router {
    Router::new(not_found_handler(), method_not_allowed_handler())
}

/// The complete per-request flow: request options, X-Forwarded-For, body
/// capture, the attempt loop, response streaming.
async fn handle_endpoint_request(
    endpoint: Arc<Endpoint>,
    strategy: Arc<RetryStrategy>,
    labels: MetricsLabels,
    breaker: Arc<SreBreaker>,
    tripper: BoxTransport,
    req: Request<Incoming>,
) -> Response<RouteBody> {
    let start = Instant::now();
    let deadline = tokio::time::Instant::now() + strategy.timeout;

    let (mut parts, inbound_body) = req.into_parts();
    let client_addr = parts.extensions.get::<ClientAddr>().copied();
    set_xff_header(&mut parts.headers, client_addr);

    let options = RequestOptions::new(endpoint.clone());
    if let Some(addr) = client_addr {
        options.set_value(janus_middleware::trace::CLIENT_IP_KEY, addr.ip().to_string());
    }

    // One in-memory copy of the body backs every attempt.
    let body = match inbound_body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            let err = GatewayError::canceled(format!("failed to read request body: {err}"));
            return write_error(&labels, &endpoint, &err, start);
        }
    };
    received_bytes_add(&labels, body.len() as u64);

    let mark_success = |i: usize| {
        if i > 0 {
            retry_state_incr(&labels, true);
            breaker.mark_success();
        }
    };
    let mark_failed = |i: usize, err: &GatewayError| {
        if i == 0 || err.is_cancellation() {
            return;
        }
        retry_state_incr(&labels, false);
        breaker.mark_failed();
    };

    let mut response: Option<Response<ResponseBody>> = None;
    let mut last_err: Option<GatewayError> = None;

    for i in 0..strategy.attempts {
        if i > 0 {
            if !retry_feature().enabled() {
                break;
            }
            if let Err(refused) = breaker.allow() {
                mark_failed(i, &refused);
                break;
            }
        }
        if i + 1 >= strategy.attempts {
            options.set_last_attempt();
        }
        if tokio::time::Instant::now() >= deadline {
            let err = GatewayError::deadline("request timeout exhausted");
            mark_failed(i, &err);
            last_err = Some(err);
            break;
        }

        let attempt_deadline =
            deadline.min(tokio::time::Instant::now() + strategy.per_try_timeout);
        let attempt_req = build_attempt_request(&parts, &endpoint, body.clone(), &options);

        match tokio::time::timeout_at(attempt_deadline, tripper.round_trip(attempt_req)).await {
            Err(_elapsed) => {
                let err = GatewayError::deadline("attempt timeout exhausted");
                mark_failed(i, &err);
                tracing::error!(
                    attempt = i + 1,
                    attempts = strategy.attempts,
                    path = %endpoint.path,
                    "attempt timed out"
                );
                response = None;
                last_err = Some(err);
            }
            Ok(Err(err)) => {
                mark_failed(i, &err);
                tracing::error!(
                    attempt = i + 1,
                    attempts = strategy.attempts,
                    path = %endpoint.path,
                    error = %err,
                    "failed to handle request"
                );
                response = None;
                last_err = Some(err);
            }
            Ok(Ok(resp)) => {
                last_err = None;
                let retry_required =
                    judge_retry_required(&strategy.conditions, resp.status(), resp.headers());
                response = Some(resp);
                if !retry_required {
                    options.set_last_attempt();
                    mark_success(i);
                    break;
                }
                mark_failed(i, &GatewayError::upstream("retry condition matched"));
            }
        }
    }

    if let Some(err) = last_err {
        return write_error(&labels, &endpoint, &err, start);
    }
    let Some(response) = response else {
        let err = GatewayError::upstream("no attempt produced a response");
        return write_error(&labels, &endpoint, &err, start);
    };

    let (parts, body) = response.into_parts();
    let observed = ObservedBody {
        inner: body,
        options,
        labels,
        reply_headers: parts.headers.clone(),
        trailers: None,
        status: parts.status.as_u16(),
        sent: 0,
        start,
        completed: false,
    };
    Response::from_parts(parts, observed.boxed())
}

fn build_attempt_request(
    parts: &http::request::Parts,
    endpoint: &Endpoint,
    body: Bytes,
    options: &Arc<RequestOptions>,
) -> Request<RequestBody> {
    let mut req = Request::new(RequestBody::new(body));
    *req.method_mut() = parts.method.clone();
    *req.uri_mut() = parts.uri.clone();
    *req.headers_mut() = parts.headers.clone();
    *req.version_mut() = match endpoint.protocol {
        Protocol::Grpc => Version::HTTP_2,
        Protocol::Http => parts.version,
    };
    options.install(&mut req);
    req
}

/// Append the client IP to `X-Forwarded-For`.
///
/// A present-but-empty header is the omit convention: an earlier hop has
/// asked for the header not to be amended.
fn set_xff_header(headers: &mut HeaderMap, client_addr: Option<ClientAddr>) {
    let Some(addr) = client_addr else {
        return;
    };
    let prior: Vec<String> = headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok().map(str::to_string))
        .collect();
    if prior.iter().any(String::is_empty) {
        return;
    }
    let client_ip = addr.ip().to_string();
    let combined = if prior.is_empty() {
        client_ip
    } else {
        format!("{}, {}", prior.join(", "), client_ip)
    };
    if let Ok(value) = HeaderValue::from_str(&combined) {
        headers.insert(&X_FORWARDED_FOR, value);
    }
}

/// Streams the upstream body to the client while accounting bytes and
/// firing the done callback exactly once at the end of the copy.
struct ObservedBody {
    inner: ResponseBody,
    options: Arc<RequestOptions>,
    labels: MetricsLabels,
    reply_headers: HeaderMap,
    trailers: Option<HeaderMap>,
    status: u16,
    sent: u64,
    start: Instant,
    completed: bool,
}

impl ObservedBody {
    fn finish(&mut self, err: Option<GatewayError>) {
        if self.completed {
            return;
        }
        self.completed = true;
        sent_bytes_add(&self.labels, self.sent);
        requests_total_incr(&self.labels, self.status);
        requests_duration_observe(&self.labels, self.start.elapsed().as_secs_f64());
        match err {
            Some(err) => {
                tracing::error!(
                    path = %self.labels.path(),
                    sent = self.sent,
                    error = %err,
                    "failed to copy backend response body to client"
                );
                self.options.invoke_done(DoneInfo { err: Some(err), reply_md: None });
            }
            None => {
                // gRPC replies carry their metadata in trailers; plain HTTP
                // in the response headers.
                let reply_md = self
                    .trailers
                    .take()
                    .unwrap_or_else(|| self.reply_headers.clone());
                self.options
                    .invoke_done(DoneInfo { err: None, reply_md: Some(reply_md) });
            }
        }
    }
}

impl Body for ObservedBody {
    type Data = Bytes;
    type Error = GatewayError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match Pin::new(&mut self.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    self.sent += data.len() as u64;
                } else if let Some(trailers) = frame.trailers_ref() {
                    self.trailers = Some(trailers.clone());
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(err))) => {
                self.finish(Some(GatewayError::upstream(err.to_string())));
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                self.finish(None);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ObservedBody {
    fn drop(&mut self) {
        // The client went away mid-copy; the selected node must still be
        // released.
        self.finish(Some(GatewayError::canceled("response body dropped")));
    }
}

/// Render an error per the gateway taxonomy; gRPC endpoints get the
/// translated `200 + Grpc-Status` form.
fn write_error(
    labels: &MetricsLabels,
    endpoint: &Endpoint,
    err: &GatewayError,
    start: Instant,
) -> Response<RouteBody> {
    let status = err.status_code();
    if !err.is_cancellation() && status != StatusCode::GATEWAY_TIMEOUT {
        tracing::error!(path = %endpoint.path, error = %err, "failed to handle request");
    }
    requests_total_incr(labels, status.as_u16());
    requests_duration_observe(labels, start.elapsed().as_secs_f64());

    if endpoint.protocol == Protocol::Grpc {
        let code = grpc_code_for_status(status);
        return Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "application/grpc")
            .header("grpc-status", code.to_string())
            .header("grpc-message", err.to_string())
            .body(empty_body())
            .expect("static response");
    }
    Response::builder()
        .status(status)
        .body(empty_body())
        .expect("static response")
}

/// Fallback handler for unmatched paths.
pub fn not_found_handler() -> BoxHandler {
    Arc::new(|req: Request<Incoming>| {
        Box::pin(async move {
            let message = "404 page not found";
            tracing::error!(
                source = "accesslog",
                host = %req.uri().host().unwrap_or(""),
                method = %req.method(),
                path = %req.uri().path(),
                query = %req.uri().query().unwrap_or(""),
                user_agent = %header_str(req.headers(), http::header::USER_AGENT),
                code = 404,
                "no route matched"
            );
            counter!(
                "go_gateway_requests_code_total",
                "protocol" => "HTTP",
                "method" => req.method().as_str().to_string(),
                "path" => "/404",
                "code" => "404",
                "service" => "",
                "basePath" => "",
            )
            .increment(1);
            text_response(StatusCode::NOT_FOUND, message)
        })
    })
}

/// Fallback handler for matched paths with an unregistered method.
pub fn method_not_allowed_handler() -> BoxHandler {
    Arc::new(|req: Request<Incoming>| {
        Box::pin(async move {
            let message = "Method Not Allowed";
            tracing::error!(
                source = "accesslog",
                host = %req.uri().host().unwrap_or(""),
                method = %req.method(),
                path = %req.uri().path(),
                query = %req.uri().query().unwrap_or(""),
                user_agent = %header_str(req.headers(), http::header::USER_AGENT),
                code = 405,
                "method not allowed"
            );
            counter!(
                "go_gateway_requests_code_total",
                "protocol" => "HTTP",
                "method" => req.method().as_str().to_string(),
                "path" => "/405",
                "code" => "405",
                "service" => "",
                "basePath" => "",
            )
            .increment(1);
            text_response(StatusCode::METHOD_NOT_ALLOWED, message)
        })
    })
}

fn register_metrics_route(router: &mut Router) -> GatewayResult<()> {
    let handler: BoxHandler = Arc::new(|req: Request<Incoming>| {
        Box::pin(async move {
            // Forwarded traffic never reaches the metrics surface.
            if req.headers().contains_key(&X_FORWARDED_FOR) {
                return text_response(StatusCode::FORBIDDEN, "Forbidden");
            }
            match janus_telemetry::metrics::handle() {
                Some(handle) => text_response(StatusCode::OK, &handle.render()),
                None => text_response(StatusCode::NOT_FOUND, "metrics recorder not installed"),
            }
        })
    });
    router.handle("/metrics", "GET", None, handler, Box::new(|| {}))
}

fn header_str(headers: &HeaderMap, name: http::header::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

fn empty_body() -> RouteBody {
    http_body_util::Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

fn text_response(status: StatusCode, body: &str) -> Response<RouteBody> {
    Response::builder()
        .status(status)
        .body(
            http_body_util::Full::new(Bytes::from(body.to_string()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("static response")
}

fn json_response<T: serde::Serialize>(value: &T) -> Response<RouteBody> {
    match serde_json::to_vec(value) {
        Ok(encoded) => Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "application/json")
            .body(
                http_body_util::Full::new(Bytes::from(encoded))
                    .map_err(|never| match never {})
                    .boxed(),
            )
            .expect("static response"),
        Err(err) => text_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

fn requests_total_incr(labels: &MetricsLabels, code: u16) {
    counter!(
        "go_gateway_requests_code_total",
        "protocol" => labels.protocol(),
        "method" => labels.method().to_string(),
        "path" => labels.path().to_string(),
        "code" => code.to_string(),
        "service" => labels.service().to_string(),
        "basePath" => labels.base_path().to_string(),
    )
    .increment(1);
}

fn requests_duration_observe(labels: &MetricsLabels, seconds: f64) {
    histogram!(
        "go_gateway_requests_duration_seconds",
        "protocol" => labels.protocol(),
        "method" => labels.method().to_string(),
        "path" => labels.path().to_string(),
        "service" => labels.service().to_string(),
        "basePath" => labels.base_path().to_string(),
    )
    .record(seconds);
}

fn received_bytes_add(labels: &MetricsLabels, received: u64) {
    counter!(
        "go_gateway_requests_rx_bytes",
        "protocol" => labels.protocol(),
        "method" => labels.method().to_string(),
        "path" => labels.path().to_string(),
        "service" => labels.service().to_string(),
        "basePath" => labels.base_path().to_string(),
    )
    .increment(received);
}

fn sent_bytes_add(labels: &MetricsLabels, sent: u64) {
    counter!(
        "go_gateway_requests_tx_bytes",
        "protocol" => labels.protocol(),
        "method" => labels.method().to_string(),
        "path" => labels.path().to_string(),
        "service" => labels.service().to_string(),
        "basePath" => labels.base_path().to_string(),
    )
    .increment(sent);
}

fn retry_state_incr(labels: &MetricsLabels, success: bool) {
    counter!(
        "go_gateway_requests_retry_state",
        "protocol" => labels.protocol(),
        "method" => labels.method().to_string(),
        "path" => labels.path().to_string(),
        "service" => labels.service().to_string(),
        "basePath" => labels.base_path().to_string(),
        "success" => if success { "true" } else { "false" },
    )
    .increment(1);
}

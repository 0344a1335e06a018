//! End-to-end proxy scenarios against live in-process backends.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;

use janus_core::config::{
    Backend, Endpoint, Gateway, MiddlewareConfig, Protocol, Retry, RetryConditionConfig,
};
use janus_proxy::Proxy;

/// One scripted backend reply.
#[derive(Clone)]
struct Script {
    status: u16,
    delay: Option<Duration>,
    body: &'static str,
}

fn script(status: u16, delay_ms: u64, body: &'static str) -> Script {
    let delay = (delay_ms > 0).then(|| Duration::from_millis(delay_ms));
    Script { status, delay, body }
}

/// Serve scripted responses over HTTP/1.1; replays the last script once
/// the queue is drained.
async fn spawn_backend(scripts: Vec<Script>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let queue = Arc::new(Mutex::new(VecDeque::from(scripts)));
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            let queue = queue.clone();
            tokio::spawn(async move {
                let service = service_fn(move |_req: Request<Incoming>| {
                    let queue = queue.clone();
                    async move {
                        let script = {
                            let mut queue = queue.lock().unwrap();
                            if queue.len() > 1 {
                                queue.pop_front().unwrap()
                            } else {
                                queue.front().cloned().unwrap()
                            }
                        };
                        if let Some(delay) = script.delay {
                            tokio::time::sleep(delay).await;
                        }
                        Ok::<_, std::convert::Infallible>(
                            Response::builder()
                                .status(script.status)
                                .body(Full::new(Bytes::from_static(script.body.as_bytes())))
                                .unwrap(),
                        )
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

/// A gRPC-flavoured backend over HTTP/2 prior knowledge: replies with a
/// non-zero grpc-status in the response headers.
async fn spawn_grpc_error_backend() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let service = service_fn(|_req: Request<Incoming>| async {
                    Ok::<_, std::convert::Infallible>(
                        Response::builder()
                            .status(StatusCode::OK)
                            .header("content-type", "application/grpc+json")
                            .header("grpc-status", "5")
                            .header("grpc-message", "nope")
                            .body(Full::new(Bytes::new()))
                            .unwrap(),
                    )
                });
                let _ = hyper::server::conn::http2::Builder::new(
                    hyper_util::rt::TokioExecutor::new(),
                )
                .serve_connection(TokioIo::new(stream), service)
                .await;
            });
        }
    });
    addr
}

/// Expose the proxy on a real listener.
async fn spawn_proxy(proxy: Arc<Proxy>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            let proxy = proxy.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let proxy = proxy.clone();
                    async move {
                        Ok::<_, std::convert::Infallible>(proxy.handle(req).await)
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

async fn send(
    addr: SocketAddr,
    method: &str,
    path: &str,
    body: &'static str,
) -> (StatusCode, String) {
    let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);
    let req = Request::builder()
        .method(method)
        .uri(path)
        .header(http::header::HOST, "test.local")
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .unwrap();
    let resp = sender.send_request(req).await.unwrap();
    let status = resp.status();
    let collected = resp.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&collected).to_string())
}

fn middleware_factory() -> janus_proxy::MiddlewareFactory {
    janus_middleware::register_builtin();
    Arc::new(|cfg: &MiddlewareConfig| janus_middleware::registry::create(cfg))
}

fn endpoint(path: &str, method: &str, backend: SocketAddr) -> Endpoint {
    Endpoint {
        path: path.to_string(),
        method: method.to_string(),
        protocol: Protocol::Http,
        timeout: Some(Duration::from_secs(2)),
        backends: vec![Backend {
            target: format!("direct://{backend}"),
            ..Backend::default()
        }],
        ..Endpoint::default()
    }
}

fn gateway(endpoints: Vec<Endpoint>) -> Gateway {
    Gateway { name: "test-gateway".into(), endpoints, ..Gateway::default() }
}

async fn proxy_for(cfg: &Gateway) -> Arc<Proxy> {
    let proxy = Proxy::new(janus_client::new_factory(None), middleware_factory());
    proxy
        .update(janus_client::BuildContext::new(cfg), cfg)
        .await
        .unwrap();
    proxy
}

#[tokio::test]
async fn test_direct_backend_success() {
    let backend = spawn_backend(vec![script(200, 0, "echo-body")]).await;
    let proxy = proxy_for(&gateway(vec![endpoint("/echo", "GET", backend)])).await;
    let addr = spawn_proxy(proxy).await;

    let (status, body) = send(addr, "GET", "/echo", "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "echo-body");
}

#[tokio::test]
async fn test_unmatched_path_is_404_and_wrong_method_is_405() {
    let backend = spawn_backend(vec![script(200, 0, "ok")]).await;
    let proxy = proxy_for(&gateway(vec![endpoint("/echo", "GET", backend)])).await;
    let addr = spawn_proxy(proxy).await;

    let (status, _) = send(addr, "GET", "/nope", "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(addr, "POST", "/echo", "").await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_retry_on_5xx_eventually_succeeds() {
    let backend =
        spawn_backend(vec![script(503, 0, "down"), script(503, 0, "down"), script(200, 0, "up")])
            .await;
    let mut ep = endpoint("/retry", "GET", backend);
    ep.retry = Some(Retry {
        attempts: 3,
        per_try_timeout: Some(Duration::from_millis(500)),
        conditions: vec![RetryConditionConfig::ByStatusCode("500-599".into())],
    });
    let proxy = proxy_for(&gateway(vec![ep])).await;
    let addr = spawn_proxy(proxy).await;

    let (status, body) = send(addr, "GET", "/retry", "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "up");
}

#[tokio::test]
async fn test_exhausted_retries_forward_last_response() {
    let backend = spawn_backend(vec![script(503, 0, "still down")]).await;
    let mut ep = endpoint("/exhaust", "GET", backend);
    ep.retry = Some(Retry {
        attempts: 2,
        per_try_timeout: Some(Duration::from_millis(500)),
        conditions: vec![RetryConditionConfig::ByStatusCode("500-599".into())],
    });
    let proxy = proxy_for(&gateway(vec![ep])).await;
    let addr = spawn_proxy(proxy).await;

    let (status, body) = send(addr, "GET", "/exhaust", "").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body, "still down");
}

#[tokio::test]
async fn test_per_attempt_timeout_yields_504() {
    let backend = spawn_backend(vec![script(200, 200, "late")]).await;
    let mut ep = endpoint("/slow", "GET", backend);
    ep.timeout = Some(Duration::from_millis(500));
    ep.retry = Some(Retry {
        attempts: 3,
        per_try_timeout: Some(Duration::from_millis(50)),
        conditions: Vec::new(),
    });
    let proxy = proxy_for(&gateway(vec![ep])).await;
    let addr = spawn_proxy(proxy).await;

    let (status, _) = send(addr, "GET", "/slow", "").await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn test_hot_reload_swaps_routing_table() {
    let backend = spawn_backend(vec![script(200, 0, "ok")]).await;
    let proxy = proxy_for(&gateway(vec![endpoint("/a", "GET", backend)])).await;
    let addr = spawn_proxy(proxy.clone()).await;

    let (status, _) = send(addr, "GET", "/a", "").await;
    assert_eq!(status, StatusCode::OK);

    let next = gateway(vec![endpoint("/b", "GET", backend)]);
    proxy
        .update(janus_client::BuildContext::new(&next), &next)
        .await
        .unwrap();

    let (status, _) = send(addr, "GET", "/a", "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(addr, "GET", "/b", "").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_discovery_churn_never_picks_removed_node() {
    use janus_discovery::{fixed::FixedDiscovery, Discovery, ServiceInstance};

    fn instance(id: &str, addr: SocketAddr) -> ServiceInstance {
        ServiceInstance {
            id: id.into(),
            name: "churn-svc".into(),
            endpoints: vec![format!("http://{addr}")],
            ..ServiceInstance::default()
        }
    }

    let n1 = spawn_backend(vec![script(200, 0, "n1")]).await;
    let n2 = spawn_backend(vec![script(200, 0, "n2")]).await;
    let n3 = spawn_backend(vec![script(200, 0, "n3")]).await;

    let discovery = Arc::new(FixedDiscovery::new());
    discovery.set_instances("churn-svc", vec![instance("1", n1), instance("2", n2)]);

    let mut ep = endpoint("/churn", "GET", n1);
    ep.backends = vec![Backend { target: "discovery:///churn-svc".into(), ..Backend::default() }];
    let cfg = gateway(vec![ep]);

    let proxy = Proxy::new(
        janus_client::new_factory(Some(discovery.clone() as Arc<dyn Discovery>)),
        middleware_factory(),
    );
    proxy
        .update(janus_client::BuildContext::new(&cfg), &cfg)
        .await
        .unwrap();
    let addr = spawn_proxy(proxy).await;

    let (status, _) = send(addr, "GET", "/churn", "").await;
    assert_eq!(status, StatusCode::OK);

    discovery.set_instances("churn-svc", vec![instance("2", n2), instance("3", n3)]);
    // Give the watcher fan-out a beat to apply the new set.
    tokio::time::sleep(Duration::from_millis(100)).await;

    for _ in 0..20 {
        let (status, body) = send(addr, "GET", "/churn", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_ne!(body, "n1", "request routed to a removed instance");
    }
}

#[tokio::test]
async fn test_grpc_error_is_transcoded_to_status_json() {
    let backend = spawn_grpc_error_backend().await;
    let mut ep = endpoint("/svc.Method", "POST", backend);
    ep.protocol = Protocol::Grpc;
    ep.middlewares = vec![MiddlewareConfig {
        name: "transcoder".into(),
        required: true,
        options: None,
    }];
    let proxy = proxy_for(&gateway(vec![ep])).await;
    let addr = spawn_proxy(proxy).await;

    let (status, body) = send(addr, "POST", "/svc.Method", "{\"x\":1}").await;
    assert_eq!(status, StatusCode::OK);
    let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(parsed["code"], 5);
    assert_eq!(parsed["message"], "nope");
}

//! Inbound server for the Janus gateway.
//!
//! Serves HTTP/1.1 and cleartext HTTP/2 (prior knowledge) on one listener
//! through the auto-negotiating connection builder, stamps every request
//! with the peer address and hands it to the gateway handler. Timeouts are
//! tunable through the `PROXY_*` environment variables.

mod timed;

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use thiserror::Error;
use tokio::net::TcpListener;

use janus_core::duration::parse_duration;
use janus_core::net::ClientAddr;
use janus_router::HandlerFuture;

use crate::timed::TimedStream;

/// Errors from the serve loop.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Binding or accepting failed.
    #[error("server io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The gateway request handler the server dispatches into.
pub trait GatewayService: Send + Sync + 'static {
    /// Handle one inbound request.
    fn call(&self, req: http::Request<Incoming>) -> HandlerFuture;
}

impl<F> GatewayService for F
where
    F: Fn(http::Request<Incoming>) -> HandlerFuture + Send + Sync + 'static,
{
    fn call(&self, req: http::Request<Incoming>) -> HandlerFuture {
        self(req)
    }
}

fn env_duration(name: &str, default: Duration) -> Duration {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => {
            parse_duration(&v).unwrap_or_else(|e| panic!("invalid {name}: {e}"))
        }
        _ => default,
    }
}

/// Server timeouts, read once from the environment.
#[derive(Debug, Clone, Copy)]
pub struct ServerTimeouts {
    /// `PROXY_READ_HEADER_TIMEOUT`, default 10s.
    pub read_header: Duration,
    /// `PROXY_READ_TIMEOUT`, default 15s. A socket read that makes no
    /// progress within this window fails the connection.
    pub read: Duration,
    /// `PROXY_WRITE_TIMEOUT`, default 15s. Same, for writes.
    pub write: Duration,
    /// `PROXY_IDLE_TIMEOUT`, default 120s.
    pub idle: Duration,
}

impl ServerTimeouts {
    /// The process-wide timeouts.
    pub fn from_env() -> Self {
        static TIMEOUTS: OnceLock<ServerTimeouts> = OnceLock::new();
        *TIMEOUTS.get_or_init(|| Self {
            read_header: env_duration("PROXY_READ_HEADER_TIMEOUT", Duration::from_secs(10)),
            read: env_duration("PROXY_READ_TIMEOUT", Duration::from_secs(15)),
            write: env_duration("PROXY_WRITE_TIMEOUT", Duration::from_secs(15)),
            idle: env_duration("PROXY_IDLE_TIMEOUT", Duration::from_secs(120)),
        })
    }
}

/// One listening proxy server.
pub struct ProxyServer {
    addr: SocketAddr,
    timeouts: ServerTimeouts,
}

impl ProxyServer {
    /// A server bound to `addr` once [`ProxyServer::run`] is called.
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr, timeouts: ServerTimeouts::from_env() }
    }

    /// Accept and serve connections until `shutdown` resolves.
    ///
    /// Each connection auto-negotiates HTTP/1.1 vs HTTP/2 (h2c prior
    /// knowledge); in-flight connections finish on their own after the
    /// accept loop stops, bounded by the idle timeout.
    pub async fn run<S, D>(self, service: S, shutdown: D) -> Result<(), ServerError>
    where
        S: GatewayService + Clone,
        D: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(self.addr).await?;
        tracing::info!(addr = %self.addr, "proxy listening");
        tokio::pin!(shutdown);

        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => accepted?,
                () = &mut shutdown => {
                    tracing::info!(addr = %self.addr, "proxy stopping");
                    return Ok(());
                }
            };
            let _ = stream.set_nodelay(true);
            let service = service.clone();
            let timeouts = self.timeouts;
            tokio::spawn(async move {
                let hyper_service = service_fn(move |mut req: http::Request<Incoming>| {
                    req.extensions_mut().insert(ClientAddr(peer));
                    let fut = service.call(req);
                    async move { Ok::<_, std::convert::Infallible>(fut.await) }
                });

                let mut builder = auto::Builder::new(TokioExecutor::new());
                builder
                    .http1()
                    .timer(TokioTimer::new())
                    .header_read_timeout(timeouts.read_header);
                builder
                    .http2()
                    .timer(TokioTimer::new())
                    .keep_alive_interval(Some(timeouts.idle / 2))
                    .keep_alive_timeout(timeouts.idle)
                    .max_concurrent_streams(None);

                // Read/write deadlines are enforced at the socket: a stalled
                // peer fails the connection instead of pinning it forever.
                let io = TimedStream::new(stream, timeouts.read, timeouts.write);
                if let Err(err) = builder
                    .serve_connection_with_upgrades(TokioIo::new(io), hyper_service)
                    .await
                {
                    tracing::debug!(peer = %peer, error = %err, "connection closed with error");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http_body_util::{BodyExt, Full};
    use std::sync::Arc;

    fn echo_service() -> impl GatewayService + Clone {
        let service: Arc<dyn Fn(http::Request<Incoming>) -> HandlerFuture + Send + Sync> =
            Arc::new(|req: http::Request<Incoming>| {
                Box::pin(async move {
                    // The server must have stamped the client address.
                    let peer = req
                        .extensions()
                        .get::<ClientAddr>()
                        .map(|a| a.ip().to_string())
                        .unwrap_or_default();
                    http::Response::builder()
                        .header("x-peer", peer)
                        .body(
                            Full::new(Bytes::from_static(b"hello"))
                                .map_err(|never| match never {})
                                .boxed(),
                        )
                        .unwrap()
                })
            });
        move |req: http::Request<Incoming>| service(req)
    }

    #[test]
    fn test_timeout_defaults() {
        if std::env::var("PROXY_READ_TIMEOUT").is_err() {
            let timeouts = ServerTimeouts::from_env();
            assert_eq!(timeouts.read, Duration::from_secs(15));
            assert_eq!(timeouts.idle, Duration::from_secs(120));
        }
    }

    #[tokio::test]
    async fn test_serves_http1_and_stamps_peer() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let server = ProxyServer::new(addr);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.run(echo_service(), async move {
            let _ = stop_rx.await;
        }));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (mut sender, conn) =
            hyper::client::conn::http1::handshake(TokioIo::new(stream)).await.unwrap();
        tokio::spawn(conn);
        let resp = sender
            .send_request(
                http::Request::builder()
                    .uri("/")
                    .header(http::header::HOST, "test")
                    .body(Full::new(Bytes::new()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), http::StatusCode::OK);
        assert_eq!(resp.headers().get("x-peer").unwrap(), "127.0.0.1");

        let _ = stop_tx.send(());
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_serves_h2c_prior_knowledge() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let server = ProxyServer::new(addr);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.run(echo_service(), async move {
            let _ = stop_rx.await;
        }));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (mut sender, conn) = hyper::client::conn::http2::handshake(
            TokioExecutor::new(),
            TokioIo::new(stream),
        )
        .await
        .unwrap();
        tokio::spawn(conn);
        let resp = sender
            .send_request(
                http::Request::builder()
                    .uri(format!("http://{addr}/"))
                    .body(Full::new(Bytes::new()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), http::StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello");

        let _ = stop_tx.send(());
        let _ = handle.await;
    }
}

//! Canonical upstream HTTP clients and the named TLS client store.
//!
//! Three process-wide pooled clients are built once and shared by
//! reference:
//!
//! - **plain**: HTTP/1.1 with keep-alive, for HTTP endpoints;
//! - **h2c**: HTTP/2 prior knowledge over cleartext TCP, for gRPC;
//! - **https-default**: rustls with ALPN `h2`/`http/1.1`, for TLS nodes
//!   without a named store entry.
//!
//! Dial timeout defaults to 200ms and is overridable through
//! `PROXY_DIAL_TIMEOUT`. Pools keep up to 1000 idle connections per host
//! for 90 seconds. None of the clients follow redirects themselves; the
//! follow-up-to-10 behaviour behind `PROXY_FOLLOW_REDIRECT` lives in the
//! dispatching client.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

use http::{Request, Response, Uri};
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use janus_core::config::{Gateway, TlsStoreEntry};
use janus_core::duration::parse_duration;
use janus_core::{GatewayError, GatewayResult};
use janus_middleware::RequestBody;

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_millis(200);
const KEEPALIVE: Duration = Duration::from_secs(30);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const MAX_IDLE_PER_HOST: usize = 1000;

/// The configured dial timeout (`PROXY_DIAL_TIMEOUT`, default 200ms).
pub fn dial_timeout() -> Duration {
    static TIMEOUT: OnceLock<Duration> = OnceLock::new();
    *TIMEOUT.get_or_init(|| match std::env::var("PROXY_DIAL_TIMEOUT") {
        Ok(v) if !v.is_empty() => parse_duration(&v)
            .unwrap_or_else(|e| panic!("invalid PROXY_DIAL_TIMEOUT: {e}")),
        _ => DEFAULT_DIAL_TIMEOUT,
    })
}

/// Whether `PROXY_FOLLOW_REDIRECT` asks the gateway to follow redirects.
pub fn follow_redirect() -> bool {
    static FOLLOW: OnceLock<bool> = OnceLock::new();
    *FOLLOW.get_or_init(|| {
        std::env::var("PROXY_FOLLOW_REDIRECT").map(|v| !v.is_empty()).unwrap_or(false)
    })
}

fn base_connector() -> HttpConnector {
    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(dial_timeout()));
    connector.set_keepalive(Some(KEEPALIVE));
    connector.set_nodelay(true);
    connector
}

/// One pooled upstream client.
#[derive(Clone)]
pub enum HttpClient {
    /// HTTP/1.1 over cleartext.
    Plain(Client<HttpConnector, RequestBody>),
    /// HTTP/2 prior knowledge over cleartext.
    H2c(Client<HttpConnector, RequestBody>),
    /// rustls with ALPN `h2`/`http/1.1`.
    Https(Client<HttpsConnector, RequestBody>),
}

impl HttpClient {
    /// Dispatch one request on this client's pool.
    pub async fn request(
        &self,
        req: Request<RequestBody>,
    ) -> GatewayResult<Response<Incoming>> {
        let result = match self {
            Self::Plain(c) | Self::H2c(c) => c.request(req).await,
            Self::Https(c) => c.request(req).await,
        };
        result.map_err(|e| GatewayError::upstream(e.to_string()))
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Plain(_) => "plain",
            Self::H2c(_) => "h2c",
            Self::Https(_) => "https",
        };
        f.debug_tuple("HttpClient").field(&kind).finish()
    }
}

/// The shared plain HTTP/1.1 client.
pub fn global_client() -> HttpClient {
    static CLIENT: OnceLock<HttpClient> = OnceLock::new();
    CLIENT
        .get_or_init(|| {
            HttpClient::Plain(
                Client::builder(TokioExecutor::new())
                    .pool_idle_timeout(POOL_IDLE_TIMEOUT)
                    .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
                    .build(base_connector()),
            )
        })
        .clone()
}

/// The shared cleartext HTTP/2 client used for gRPC backends.
pub fn global_h2c_client() -> HttpClient {
    static CLIENT: OnceLock<HttpClient> = OnceLock::new();
    CLIENT
        .get_or_init(|| {
            HttpClient::H2c(
                Client::builder(TokioExecutor::new())
                    .http2_only(true)
                    .pool_idle_timeout(POOL_IDLE_TIMEOUT)
                    .build(base_connector()),
            )
        })
        .clone()
}

/// The shared HTTPS client backed by the platform trust anchors.
pub fn global_https_client() -> HttpClient {
    static CLIENT: OnceLock<HttpClient> = OnceLock::new();
    CLIENT
        .get_or_init(|| create_https_client(Arc::new(default_tls_config())))
        .clone()
}

fn default_tls_config() -> ClientConfig {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    config
}

fn create_https_client(tls_config: Arc<ClientConfig>) -> HttpClient {
    HttpClient::Https(
        Client::builder(TokioExecutor::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .build(HttpsConnector::new(tls_config)),
    )
}

/// TCP + rustls connector with ALPN-aware HTTP/2 negotiation.
///
/// Pairs the pooled client's TCP connector with tokio-rustls directly and
/// reports a negotiated `h2` session so the pool multiplexes over it.
#[derive(Clone)]
pub struct HttpsConnector {
    http: HttpConnector,
    tls: TlsConnector,
}

impl HttpsConnector {
    fn new(config: Arc<ClientConfig>) -> Self {
        let mut http = base_connector();
        // The inner connector only dials TCP here; the `https` scheme is
        // handled by the TLS layer above it.
        http.enforce_http(false);
        Self { http, tls: TlsConnector::from(config) }
    }
}

impl tower_service::Service<Uri> for HttpsConnector {
    type Response = TlsStream;
    type Error = Box<dyn std::error::Error + Send + Sync>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        tower_service::Service::poll_ready(&mut self.http, cx).map_err(Into::into)
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let mut http = self.http.clone();
        let tls = self.tls.clone();
        Box::pin(async move {
            let host = uri.host().unwrap_or_default().to_string();
            let tcp = tower_service::Service::call(&mut http, uri).await?.into_inner();
            let server_name = ServerName::try_from(host.clone())
                .map_err(|e| format!("invalid server name {host:?}: {e}"))?;
            let stream = tls.connect(server_name, tcp).await?;
            let negotiated_h2 = stream.get_ref().1.alpn_protocol() == Some(b"h2");
            Ok(TlsStream { io: TokioIo::new(stream), negotiated_h2 })
        })
    }
}

/// A TLS upstream connection usable by the pooled client.
pub struct TlsStream {
    io: TokioIo<tokio_rustls::client::TlsStream<TcpStream>>,
    negotiated_h2: bool,
}

impl Connection for TlsStream {
    fn connected(&self) -> Connected {
        let connected = Connected::new();
        if self.negotiated_h2 {
            connected.negotiated_h2()
        } else {
            connected
        }
    }
}

impl hyper::rt::Read for TlsStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl hyper::rt::Write for TlsStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

/// Named TLS client configurations and the clients lazily built from them.
pub struct HttpsClientStore {
    configs: HashMap<String, Arc<ClientConfig>>,
    clients: Mutex<HashMap<String, HttpClient>>,
}

impl HttpsClientStore {
    /// Build a store over pre-parsed TLS configs.
    #[must_use]
    pub fn new(configs: HashMap<String, Arc<ClientConfig>>) -> Self {
        Self { configs, clients: Mutex::new(HashMap::new()) }
    }

    /// Fetch the client for a named TLS config.
    ///
    /// An empty name yields the plain client; an unknown name logs a
    /// warning and yields the default HTTPS client.
    pub fn get_client(&self, name: &str) -> HttpClient {
        if name.is_empty() {
            return global_client();
        }
        let mut clients = self.clients.lock().expect("https store poisoned");
        if let Some(client) = clients.get(name) {
            return client.clone();
        }
        let Some(config) = self.configs.get(name) else {
            tracing::warn!(name, "tls config not found, using default instead");
            return global_https_client();
        };
        let client = create_https_client(config.clone());
        clients.insert(name.to_string(), client.clone());
        client
    }
}

/// Everything an endpoint build needs that outlives the endpoint: the
/// parsed TLS store and its client cache.
pub struct BuildContext {
    /// Parsed named TLS configs.
    pub tls_configs: HashMap<String, Arc<ClientConfig>>,
    /// Client cache over those configs.
    pub tls_client_store: HttpsClientStore,
}

impl BuildContext {
    /// A context with no named TLS configs.
    #[must_use]
    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            tls_configs: HashMap::new(),
            tls_client_store: HttpsClientStore::new(HashMap::new()),
        })
    }

    /// Parse the gateway's TLS store. Entries that fail to parse are
    /// logged and skipped so one bad cert cannot block a reload.
    #[must_use]
    pub fn new(cfg: &Gateway) -> Arc<Self> {
        let mut tls_configs = HashMap::with_capacity(cfg.tls_store.len());
        for (name, entry) in &cfg.tls_store {
            match build_tls_config(entry) {
                Ok(config) => {
                    tls_configs.insert(name.clone(), Arc::new(config));
                }
                Err(err) => {
                    tracing::warn!(name = %name, error = %err, "failed to load tls config");
                }
            }
        }
        Arc::new(Self {
            tls_client_store: HttpsClientStore::new(tls_configs.clone()),
            tls_configs,
        })
    }
}

fn build_tls_config(entry: &TlsStoreEntry) -> GatewayResult<ClientConfig> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut entry.cert.as_bytes())
        .collect::<Result<_, _>>()
        .map_err(|e| GatewayError::config(format!("bad tls cert: {e}")))?;
    let key = rustls_pemfile::private_key(&mut entry.key.as_bytes())
        .map_err(|e| GatewayError::config(format!("bad tls key: {e}")))?
        .ok_or_else(|| GatewayError::config("tls key pem contains no key"))?;

    let mut roots = RootCertStore::empty();
    match &entry.cacert {
        Some(cacert) => {
            for cert in rustls_pemfile::certs(&mut cacert.as_bytes()) {
                let cert = cert.map_err(|e| GatewayError::config(format!("bad cacert: {e}")))?;
                roots
                    .add(cert)
                    .map_err(|e| GatewayError::config(format!("bad cacert: {e}")))?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let mut config = builder
        .with_client_auth_cert(certs, key)
        .map_err(|e| GatewayError::config(format!("bad tls keypair: {e}")))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    if entry.insecure {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(danger::NoVerifier::new()));
    }
    Ok(config)
}

mod danger {
    //! Verification bypass for `insecure: true` store entries.

    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};

    #[derive(Debug)]
    pub struct NoVerifier(CryptoProvider);

    impl NoVerifier {
        pub fn new() -> Self {
            Self(rustls::crypto::ring::default_provider())
        }
    }

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}

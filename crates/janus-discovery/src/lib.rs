//! Service discovery interface for the Janus gateway.
//!
//! The gateway never talks to a concrete registry (Consul, etcd, …)
//! directly; it consumes the [`Discovery`] trait. Providers register a
//! factory under a DSN scheme (`consul://host:port?token=…`) and the
//! binary resolves the configured DSN through [`create`].
//!
//! The in-repo [`fixed::FixedDiscovery`] provider serves tests and demos
//! with a push-updatable instance list.

pub mod fixed;

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Result alias for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Errors surfaced by discovery providers and the registry.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// The watch was canceled; the watch loop must terminate, not retry.
    #[error("watch canceled")]
    Canceled,

    /// The provider is temporarily unable to serve updates.
    #[error("discovery unavailable: {message}")]
    Unavailable {
        /// Provider-specific cause.
        message: String,
    },

    /// The DSN could not be parsed or is empty.
    #[error("invalid discovery dsn: {message}")]
    InvalidDsn {
        /// What was wrong with the DSN.
        message: String,
    },

    /// No provider factory is registered for the DSN scheme.
    #[error("discovery {scheme} has not been registered")]
    NotRegistered {
        /// The unknown scheme.
        scheme: String,
    },
}

impl DiscoveryError {
    /// Whether the watch loop should terminate instead of backing off.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

/// One live instance of a discovered service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Registry-unique instance id.
    pub id: String,
    /// Service name.
    pub name: String,
    /// Instance version tag.
    pub version: String,
    /// Instance metadata; `weight` feeds load balancing.
    pub metadata: HashMap<String, String>,
    /// Endpoint URIs, e.g. `http://10.0.0.1:8000?isSecure=false` or
    /// `grpc://10.0.0.1:9000`.
    pub endpoints: Vec<String>,
}

/// A per-service subscription producing instance-list snapshots.
#[async_trait]
pub trait Watcher: Send {
    /// Block until the next instance list is available.
    ///
    /// The first call returns the current list. Returning
    /// [`DiscoveryError::Canceled`] terminates the watch loop.
    async fn next(&mut self) -> DiscoveryResult<Vec<ServiceInstance>>;
}

/// A discovery backend able to open per-service watches.
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// Open a watch for the given service key.
    async fn watch(&self, service: &str) -> DiscoveryResult<Box<dyn Watcher>>;
}

/// Factory building a provider from a parsed DSN.
pub type Factory =
    Box<dyn Fn(&Url) -> DiscoveryResult<std::sync::Arc<dyn Discovery>> + Send + Sync>;

fn registry() -> &'static Mutex<HashMap<String, Factory>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Factory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register a provider factory under a DSN scheme.
pub fn register(scheme: &str, factory: Factory) {
    registry()
        .lock()
        .expect("discovery registry poisoned")
        .insert(scheme.to_ascii_lowercase(), factory);
}

/// Build a provider from a DSN like `consul://127.0.0.1:8500?token=secret`.
pub fn create(dsn: &str) -> DiscoveryResult<std::sync::Arc<dyn Discovery>> {
    if dsn.is_empty() {
        return Err(DiscoveryError::InvalidDsn { message: "empty dsn".into() });
    }
    let url = Url::parse(dsn).map_err(|e| DiscoveryError::InvalidDsn { message: e.to_string() })?;
    let map = registry().lock().expect("discovery registry poisoned");
    let factory = map
        .get(url.scheme())
        .ok_or_else(|| DiscoveryError::NotRegistered { scheme: url.scheme().to_string() })?;
    factory(&url)
}

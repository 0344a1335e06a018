//! Load-balancer abstractions shared by the middleware and client layers.
//!
//! A [`Selector`] owns the live node set for one endpoint and hands out
//! `(node, done)` pairs per request. Implementations live in the client
//! crate; this module only defines the interface so that request-scoped
//! state (node filters, the done callback) can be carried through the
//! middleware layer without depending on it.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use http::HeaderMap;

use crate::error::GatewayError;

/// One selectable backend instance.
pub trait Node: Send + Sync + 'static {
    /// Lowercased wire scheme (`http` or `grpc`).
    fn scheme(&self) -> &str;
    /// Dialable authority, `host:port`.
    fn address(&self) -> &str;
    /// Owning service name; empty for direct backends.
    fn service_name(&self) -> &str;
    /// Initial load-balancing weight, if configured.
    fn initial_weight(&self) -> Option<i64>;
    /// Instance version tag.
    fn version(&self) -> &str;
    /// Instance metadata.
    fn metadata(&self) -> &HashMap<String, String>;
    /// Concrete-type escape hatch for the dispatching client.
    fn as_any(&self) -> &dyn Any;
}

/// Reply metadata handed to the done callback: response trailers for gRPC,
/// response headers otherwise.
pub type ReplyMd = HeaderMap;

/// Outcome of one selected node's round trip.
#[derive(Debug, Default)]
pub struct DoneInfo {
    /// Transport error, if the round trip failed.
    pub err: Option<GatewayError>,
    /// Reply metadata on success.
    pub reply_md: Option<ReplyMd>,
}

/// Callback invoked exactly once per selected node, after the response body
/// has been fully copied or the attempt failed.
pub type DoneFunc = Box<dyn FnOnce(DoneInfo) + Send>;

/// Pure candidate filter applied before picking.
pub type NodeFilter = Arc<dyn Fn(Vec<Arc<dyn Node>>) -> Vec<Arc<dyn Node>> + Send + Sync>;

/// Load balancer producing `(node, done)` pairs.
pub trait Selector: Send + Sync {
    /// Replace the candidate set atomically.
    fn apply(&self, nodes: Vec<Arc<dyn Node>>);

    /// Pick one node after running `filters` over the candidate set.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NoInstances`] when no candidates remain.
    fn select(&self, filters: &[NodeFilter]) -> Result<(Arc<dyn Node>, DoneFunc), GatewayError>;
}

//! Per-request state threaded through the middleware chain.
//!
//! The proxy seeds every inbound request with an `Arc<RequestOptions>`
//! stored in the request extensions; middlewares and the upstream client
//! read and update it from there. One instance lives for the whole attempt
//! chain of a request.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use http::Request;

use janus_core::config::Endpoint;
use janus_core::selector::{DoneFunc, DoneInfo, Node, NodeFilter};

/// Mutable per-request bookkeeping behind one lock.
#[derive(Default)]
struct RequestState {
    /// Addresses already tried in this attempt chain.
    backends: Vec<String>,
    /// Status code per upstream attempt; 0 for transport failures.
    upstream_status: Vec<u16>,
    /// Upstream response time per attempt, seconds.
    upstream_elapsed: Vec<f64>,
    /// Address of the most recently selected node.
    current_node: Option<String>,
    /// Done callback of the most recent successful selection.
    done: Option<DoneFunc>,
    /// Free-form key/value bag for middlewares.
    values: HashMap<String, Box<dyn Any + Send + Sync>>,
}

/// Request-scoped options shared across attempts.
pub struct RequestOptions {
    endpoint: Arc<Endpoint>,
    filters: Vec<NodeFilter>,
    last_attempt: AtomicBool,
    state: Mutex<RequestState>,
}

impl RequestOptions {
    /// Build the options for one inbound request, pre-seeded with the
    /// retry-exclusion node filter.
    ///
    /// The filter needs a handle back to the options it belongs to, hence
    /// the cyclic construction through a weak reference.
    #[must_use]
    pub fn new(endpoint: Arc<Endpoint>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            endpoint,
            filters: vec![retry_exclusion_filter(weak.clone())],
            last_attempt: AtomicBool::new(false),
            state: Mutex::new(RequestState::default()),
        })
    }

    /// The endpoint this request resolved to.
    #[must_use]
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Node filters to apply on selection.
    #[must_use]
    pub fn filters(&self) -> &[NodeFilter] {
        &self.filters
    }

    /// Record a selected node before dispatch.
    pub fn record_selection(&self, address: &str) {
        let mut state = self.state.lock().expect("request state poisoned");
        state.backends.push(address.to_string());
        state.current_node = Some(address.to_string());
    }

    /// Addresses tried so far.
    #[must_use]
    pub fn backends_tried(&self) -> Vec<String> {
        self.state.lock().expect("request state poisoned").backends.clone()
    }

    /// Address of the node currently being dialled.
    #[must_use]
    pub fn current_node(&self) -> Option<String> {
        self.state.lock().expect("request state poisoned").current_node.clone()
    }

    /// Record one upstream attempt outcome.
    pub fn record_upstream(&self, status: u16, elapsed_secs: f64) {
        let mut state = self.state.lock().expect("request state poisoned");
        state.upstream_status.push(status);
        state.upstream_elapsed.push(elapsed_secs);
    }

    /// Status codes observed per attempt (0 = transport failure).
    #[must_use]
    pub fn upstream_status_codes(&self) -> Vec<u16> {
        self.state.lock().expect("request state poisoned").upstream_status.clone()
    }

    /// Upstream response times in seconds, one per attempt.
    #[must_use]
    pub fn upstream_response_times(&self) -> Vec<f64> {
        self.state.lock().expect("request state poisoned").upstream_elapsed.clone()
    }

    /// Store the done callback for the current selection, dropping (and
    /// thereby completing) any previous one first.
    pub fn set_done(&self, done: DoneFunc) {
        self.state.lock().expect("request state poisoned").done = Some(done);
    }

    /// Invoke the stored done callback exactly once.
    ///
    /// Later calls are no-ops, which is what makes the exactly-once
    /// contract hold across the error and success paths.
    pub fn invoke_done(&self, info: DoneInfo) {
        let done = self.state.lock().expect("request state poisoned").done.take();
        if let Some(done) = done {
            done(info);
        }
    }

    /// Whether the attempt in flight is the last one.
    #[must_use]
    pub fn last_attempt(&self) -> bool {
        self.last_attempt.load(Ordering::Relaxed)
    }

    /// Mark the attempt in flight as the last one.
    pub fn set_last_attempt(&self) {
        self.last_attempt.store(true, Ordering::Relaxed);
    }

    /// Store a value in the request bag.
    pub fn set_value<T: Any + Send + Sync>(&self, key: &str, value: T) {
        self.state
            .lock()
            .expect("request state poisoned")
            .values
            .insert(key.to_string(), Box::new(value));
    }

    /// Read a cloneable value from the request bag.
    #[must_use]
    pub fn value<T: Any + Send + Sync + Clone>(&self, key: &str) -> Option<T> {
        self.state
            .lock()
            .expect("request state poisoned")
            .values
            .get(key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    /// Fetch the options an earlier layer stored on `req`.
    #[must_use]
    pub fn from_request<B>(req: &Request<B>) -> Option<Arc<Self>> {
        req.extensions().get::<Arc<Self>>().cloned()
    }

    /// Store these options on `req` for downstream layers.
    pub fn install<B>(self: &Arc<Self>, req: &mut Request<B>) {
        req.extensions_mut().insert(Arc::clone(self));
    }
}

/// Drops nodes whose address was already tried; yields the unfiltered set
/// back when exclusion would leave the selector with nothing.
fn retry_exclusion_filter(options: Weak<RequestOptions>) -> NodeFilter {
    Arc::new(move |nodes: Vec<Arc<dyn Node>>| {
        let Some(options) = options.upgrade() else {
            return nodes;
        };
        let tried = options.backends_tried();
        if tried.is_empty() {
            return nodes;
        }
        let remaining: Vec<_> = nodes
            .iter()
            .filter(|n| !tried.iter().any(|t| t == n.address()))
            .cloned()
            .collect();
        if remaining.is_empty() {
            return nodes;
        }
        remaining
    })
}

/// Fixed metric labels derived from an endpoint.
#[derive(Debug, Clone)]
pub struct MetricsLabels {
    protocol: &'static str,
    method: String,
    path: String,
    service: String,
    base_path: String,
}

impl MetricsLabels {
    /// Derive the labels for an endpoint.
    #[must_use]
    pub fn new(endpoint: &Endpoint) -> Self {
        Self {
            protocol: endpoint.protocol.as_str(),
            method: endpoint.method.clone(),
            path: endpoint.path.clone(),
            service: endpoint.service().to_string(),
            base_path: endpoint.base_path().to_string(),
        }
    }

    /// `protocol` label.
    #[must_use]
    pub fn protocol(&self) -> &'static str {
        self.protocol
    }

    /// `method` label.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// `path` label.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// `service` label.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// `basePath` label.
    #[must_use]
    pub fn base_path(&self) -> &str {
        &self.base_path
    }
}

//! Upstream client layer for the Janus gateway.
//!
//! Turns an endpoint's backend descriptors into a live, load-balanced
//! [`Transport`](janus_middleware::Transport):
//!
//! - [`target`] parses `direct://` and `discovery://` backend URIs.
//! - [`pool`] owns the three canonical pooled HTTP clients and the named
//!   TLS client store.
//! - [`node`] is one dialable backend instance bound to its client.
//! - [`watch`] is the process-wide service watcher fanning discovery
//!   updates out to subscribed appliers.
//! - [`applier`] keeps one endpoint's node set in sync with its backends.
//! - [`selector`] is the default power-of-two-choices load balancer.
//! - [`client`] dispatches a request to a selected node.
//!
//! The [`new_factory`] entry point packages all of it behind the
//! `ClientFactory` the proxy consumes per endpoint build.

pub mod applier;
pub mod client;
pub mod node;
pub mod pool;
pub mod selector;
pub mod target;
pub mod watch;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use janus_core::config::Endpoint;
use janus_core::GatewayResult;
use janus_discovery::Discovery;

pub use client::UpstreamClient;
pub use node::Node;
pub use pool::{BuildContext, HttpClient, HttpsClientStore};
pub use selector::P2cSelector;
pub use watch::ServiceWatcher;

/// Per-endpoint client builder handed to the proxy.
///
/// Building a client may block on the initial discovery snapshot, hence
/// the boxed future.
pub type ClientFactory = Arc<
    dyn Fn(
            Arc<BuildContext>,
            Arc<Endpoint>,
        ) -> Pin<Box<dyn Future<Output = GatewayResult<Arc<UpstreamClient>>> + Send>>
        + Send
        + Sync,
>;

/// Build the default client factory.
///
/// `discovery` is consulted for `discovery://` backends; endpoints made
/// solely of `direct://` backends work without one.
#[must_use]
pub fn new_factory(discovery: Option<Arc<dyn Discovery>>) -> ClientFactory {
    Arc::new(move |build_ctx: Arc<BuildContext>, endpoint: Arc<Endpoint>| {
        let discovery = discovery.clone();
        Box::pin(async move {
            let picker = Arc::new(P2cSelector::new(&endpoint.path));
            let applier = applier::NodeApplier::new(build_ctx, endpoint, picker.clone());
            applier.apply(discovery).await?;
            Ok(Arc::new(UpstreamClient::new(applier, picker)))
        })
    })
}

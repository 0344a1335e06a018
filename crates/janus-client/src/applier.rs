//! Per-endpoint node applier.
//!
//! Owns the live node set for one endpoint: direct backends are pushed
//! into the selector at build time, discovery backends subscribe to the
//! shared service watcher and rebuild the set on every callback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use janus_core::config::{Backend, Endpoint};
use janus_core::selector::Selector;
use janus_core::{GatewayError, GatewayResult};
use janus_discovery::{Discovery, DiscoveryError, DiscoveryResult, ServiceInstance};

use crate::node::{Node, NodeOptions};
use crate::pool::BuildContext;
use crate::target::{parse_endpoint, parse_target};
use crate::watch::{self, Subscriber};

const DEFAULT_WEIGHT: i64 = 10;

/// Weight for a discovered instance: its `weight` metadata entry, falling
/// back to 10 when absent or non-positive.
fn node_weight(instance: &ServiceInstance) -> i64 {
    instance
        .metadata
        .get("weight")
        .and_then(|w| w.parse::<i64>().ok())
        .filter(|w| *w > 0)
        .unwrap_or(DEFAULT_WEIGHT)
}

fn direct_address(backend: &Backend, authority: &str) -> String {
    if authority.is_empty() {
        backend.target.clone()
    } else {
        authority.to_string()
    }
}

/// Keeps one endpoint's selector fed with nodes.
pub struct NodeApplier {
    canceled: AtomicBool,
    build_ctx: Arc<BuildContext>,
    endpoint: Arc<Endpoint>,
    selector: Arc<dyn Selector>,
}

impl NodeApplier {
    /// Build an applier for one endpoint.
    #[must_use]
    pub fn new(
        build_ctx: Arc<BuildContext>,
        endpoint: Arc<Endpoint>,
        selector: Arc<dyn Selector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            canceled: AtomicBool::new(false),
            build_ctx,
            endpoint,
            selector,
        })
    }

    /// Resolve every backend: direct targets become nodes immediately,
    /// discovery targets subscribe to the shared watcher.
    pub async fn apply(
        self: &Arc<Self>,
        discovery: Option<Arc<dyn Discovery>>,
    ) -> GatewayResult<()> {
        let mut direct_nodes = Vec::new();
        for backend in &self.endpoint.backends {
            let target = parse_target(&backend.target)?;
            match target.scheme.as_str() {
                "direct" => {
                    let node = Node::new(
                        &self.build_ctx,
                        direct_address(backend, &target.authority),
                        self.endpoint.protocol,
                        backend.weight,
                        backend.metadata.clone(),
                        "",
                        "",
                        NodeOptions {
                            tls: backend.tls,
                            tls_config_name: backend.tls_config_name.clone(),
                        },
                    );
                    direct_nodes.push(node as Arc<dyn janus_core::selector::Node>);
                    self.selector.apply(direct_nodes.clone());
                }
                "discovery" => {
                    let discovery = discovery.clone().ok_or_else(|| {
                        GatewayError::config(format!(
                            "backend {} requires discovery but none is configured",
                            backend.target
                        ))
                    })?;
                    let existed = watch::global()
                        .add(discovery, &target.endpoint, self.clone() as Arc<dyn Subscriber>)
                        .await;
                    if existed {
                        tracing::info!(target = %backend.target, "watch target already existed");
                    }
                }
                other => {
                    return Err(GatewayError::config(format!("unknown scheme: {other}")));
                }
            }
        }
        Ok(())
    }

    /// Stop applying updates; the watcher's reaper removes the
    /// subscription on its next pass.
    pub fn cancel(&self) {
        tracing::info!(path = %self.endpoint.path, "closing node applier");
        self.canceled.store(true, Ordering::SeqCst);
    }
}

impl Subscriber for NodeApplier {
    fn callback(&self, instances: &[ServiceInstance]) -> DiscoveryResult<()> {
        if self.canceled.load(Ordering::SeqCst) {
            return Err(DiscoveryError::Canceled);
        }
        if instances.is_empty() {
            return Ok(());
        }
        let scheme = self.endpoint.protocol.scheme();
        let mut nodes: Vec<Arc<dyn janus_core::selector::Node>> =
            Vec::with_capacity(instances.len());
        for instance in instances {
            let address = match parse_endpoint(&instance.endpoints, scheme, false) {
                Ok(address) if !address.is_empty() => address,
                Ok(_) => {
                    tracing::error!(
                        endpoints = ?instance.endpoints,
                        scheme,
                        "no matching endpoint on instance"
                    );
                    continue;
                }
                Err(err) => {
                    tracing::error!(
                        endpoints = ?instance.endpoints,
                        scheme,
                        error = %err,
                        "failed to parse instance endpoint"
                    );
                    continue;
                }
            };
            nodes.push(Node::new(
                &self.build_ctx,
                address,
                self.endpoint.protocol,
                Some(node_weight(instance)),
                instance.metadata.clone(),
                instance.version.clone(),
                instance.name.clone(),
                NodeOptions::default(),
            ));
        }
        self.selector.apply(nodes);
        Ok(())
    }

    fn canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }
}

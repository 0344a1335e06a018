//! One dialable backend instance.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use janus_core::config::Protocol;
use janus_core::selector;

use crate::pool::{global_client, global_h2c_client, global_https_client, BuildContext, HttpClient};

/// TLS options applied when building a node.
#[derive(Debug, Clone, Default)]
pub struct NodeOptions {
    /// Dial over TLS.
    pub tls: bool,
    /// Named entry in the TLS client store.
    pub tls_config_name: Option<String>,
}

/// A resolved backend instance bound to the client that dials it.
///
/// Nodes are owned by their endpoint's applier and replaced wholesale on
/// every discovery update or endpoint rebuild.
#[derive(Debug)]
pub struct Node {
    address: String,
    name: String,
    weight: Option<i64>,
    version: String,
    metadata: HashMap<String, String>,
    protocol: Protocol,
    tls: bool,
    client: HttpClient,
}

impl Node {
    /// Build a node, picking its client from the protocol and TLS options:
    /// gRPC uses the h2c client, TLS nodes use the store, everything else
    /// the plain client.
    #[must_use]
    pub fn new(
        build_ctx: &BuildContext,
        address: impl Into<String>,
        protocol: Protocol,
        weight: Option<i64>,
        metadata: HashMap<String, String>,
        version: impl Into<String>,
        name: impl Into<String>,
        options: NodeOptions,
    ) -> Arc<Self> {
        let mut client = match protocol {
            Protocol::Grpc => global_h2c_client(),
            Protocol::Http => global_client(),
        };
        let mut tls = false;
        if options.tls {
            tls = true;
            client = match options.tls_config_name.as_deref() {
                Some(config_name) if !config_name.is_empty() => {
                    build_ctx.tls_client_store.get_client(config_name)
                }
                _ => global_https_client(),
            };
        }
        Arc::new(Self {
            address: address.into(),
            name: name.into(),
            weight,
            version: version.into(),
            metadata,
            protocol,
            tls,
            client,
        })
    }

    /// The pooled client this node dials through.
    #[must_use]
    pub fn client(&self) -> &HttpClient {
        &self.client
    }

    /// Whether requests to this node use `https`.
    #[must_use]
    pub fn tls(&self) -> bool {
        self.tls
    }

    /// The backend protocol this node serves.
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }
}

impl selector::Node for Node {
    fn scheme(&self) -> &str {
        self.protocol.scheme()
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn service_name(&self) -> &str {
        &self.name
    }

    fn initial_weight(&self) -> Option<i64> {
        self.weight
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use janus_core::selector::Node as _;

    #[test]
    fn test_grpc_node_uses_h2c_client() {
        let ctx = BuildContext::empty();
        let node = Node::new(
            &ctx,
            "10.0.0.1:9000",
            Protocol::Grpc,
            None,
            HashMap::new(),
            "",
            "",
            NodeOptions::default(),
        );
        assert!(matches!(node.client(), HttpClient::H2c(_)));
        assert_eq!(node.scheme(), "grpc");
        assert!(!node.tls());
    }

    #[test]
    fn test_http_node_uses_plain_client() {
        let ctx = BuildContext::empty();
        let node = Node::new(
            &ctx,
            "10.0.0.1:8000",
            Protocol::Http,
            Some(10),
            HashMap::new(),
            "v1",
            "svc",
            NodeOptions::default(),
        );
        assert!(matches!(node.client(), HttpClient::Plain(_)));
        assert_eq!(node.initial_weight(), Some(10));
        assert_eq!(node.service_name(), "svc");
        assert_eq!(node.version(), "v1");
    }

    #[test]
    fn test_tls_node_uses_https_client() {
        let ctx = BuildContext::empty();
        let node = Node::new(
            &ctx,
            "10.0.0.1:8443",
            Protocol::Http,
            None,
            HashMap::new(),
            "",
            "",
            NodeOptions { tls: true, tls_config_name: None },
        );
        assert!(matches!(node.client(), HttpClient::Https(_)));
        assert!(node.tls());
    }
}

//! Configuration model for one gateway generation.
//!
//! A [`Gateway`] is the unit of hot reload: the proxy consumes a fully
//! deserialized `Gateway` and either installs all of its endpoints or none
//! of them. Endpoints are immutable once built; a config change produces a
//! new generation rather than mutating the old one.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Wire protocol spoken to an endpoint's backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    /// Plain HTTP/1.1 (or HTTPS for TLS-enabled nodes).
    #[default]
    Http,
    /// gRPC over HTTP/2 (h2c unless the node is TLS-enabled).
    Grpc,
}

impl Protocol {
    /// Uppercase name used in metric labels and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "HTTP",
            Self::Grpc => "GRPC",
        }
    }

    /// Lowercase scheme used to match discovery instance URIs.
    #[must_use]
    pub const fn scheme(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Grpc => "grpc",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Gateway {
    /// Gateway instance name, used as the telemetry service name.
    pub name: String,
    /// Config version tag, opaque to the proxy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Global middlewares applied to every endpoint, outermost last.
    pub middlewares: Vec<MiddlewareConfig>,
    /// Routed endpoints.
    pub endpoints: Vec<Endpoint>,
    /// Named TLS client configurations referenced by backends.
    pub tls_store: HashMap<String, TlsStoreEntry>,
}

/// One routed endpoint. Identity is `(method, host, path)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Endpoint {
    /// Path pattern: exact, regex, `{name}` template, or `*`-suffixed prefix.
    pub path: String,
    /// HTTP method; empty or `*` matches any.
    pub method: String,
    /// Optional host constraint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Backend protocol.
    pub protocol: Protocol,
    /// Total request timeout. Unset or zero falls back to 1s.
    #[serde(with = "crate::duration::option", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    /// Retry policy; absent means a single attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<Retry>,
    /// Backend descriptors (direct addresses or discovery names).
    pub backends: Vec<Backend>,
    /// Endpoint-local middlewares, composed inside the global ones.
    pub middlewares: Vec<MiddlewareConfig>,
    /// Free-form metadata; `service` and `basePath` feed metric labels.
    pub metadata: HashMap<String, String>,
}

impl Endpoint {
    /// Metric label: the `service` metadata entry, empty when unset.
    #[must_use]
    pub fn service(&self) -> &str {
        self.metadata.get("service").map_or("", String::as_str)
    }

    /// Metric label: the `basePath` metadata entry, empty when unset.
    #[must_use]
    pub fn base_path(&self) -> &str {
        self.metadata.get("basePath").map_or("", String::as_str)
    }
}

/// Where an endpoint sends traffic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Backend {
    /// Target URI: `direct://host:port`, `discovery://service`, or a bare
    /// `host:port` (treated as direct).
    pub target: String,
    /// Explicit weight; only meaningful for direct targets.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<i64>,
    /// Per-backend metadata handed to the node.
    pub metadata: HashMap<String, String>,
    /// Dial this backend over TLS.
    pub tls: bool,
    /// Named entry in the gateway TLS store; empty uses the default client.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_config_name: Option<String>,
}

/// Retry policy for an endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Retry {
    /// Attempt budget including the first attempt; 0 means 1.
    pub attempts: u32,
    /// Deadline for each attempt. Falls back to the endpoint timeout, then 1s.
    #[serde(with = "crate::duration::option", skip_serializing_if = "Option::is_none")]
    pub per_try_timeout: Option<Duration>,
    /// Conditions under which a response demands another attempt.
    pub conditions: Vec<RetryConditionConfig>,
}

/// One retry condition as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RetryConditionConfig {
    /// Status code list (`"501,502"`) or inclusive range (`"500-599"`).
    ByStatusCode(String),
    /// Response header equality.
    ByHeader {
        /// Header name.
        name: String,
        /// Expected value.
        value: String,
    },
}

/// Middleware reference inside a gateway or endpoint config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MiddlewareConfig {
    /// Registry name, matched case-insensitively.
    pub name: String,
    /// When true a factory failure fails the whole endpoint build.
    pub required: bool,
    /// Opaque options blob interpreted by the named factory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
}

/// Named TLS client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TlsStoreEntry {
    /// Client certificate, PEM.
    pub cert: String,
    /// Client private key, PEM.
    pub key: String,
    /// Optional CA bundle, PEM. Absent uses the platform roots.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cacert: Option<String>,
    /// SNI server name override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    /// Skip upstream certificate verification.
    pub insecure: bool,
}

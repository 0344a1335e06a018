//! Request/response rewriting middleware.
//!
//! Applies, in order: path replacement, host replacement, prefix stripping,
//! request header edits; response header edits on the way back.

use std::sync::Arc;

use http::header::HOST;
use http::uri::PathAndQuery;
use http::{HeaderMap, HeaderName, HeaderValue, Request, Uri};
use serde::Deserialize;

use crate::registry::{self, Factory, MiddlewareError, MiddlewareResult};
use crate::transport::{BoxMiddleware, BoxTransport, FnMiddleware, RequestBody, TransportFn};

/// Header edit set applied as set → add → remove.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeadersRewrite {
    /// Replace these headers.
    pub set: std::collections::HashMap<String, String>,
    /// Append these headers.
    pub add: std::collections::HashMap<String, String>,
    /// Drop these headers.
    pub remove: Vec<String>,
}

/// Options blob for the rewrite middleware.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RewriteConfig {
    /// Replace the URL path outright.
    pub path_rewrite: Option<String>,
    /// Replace the Host header.
    pub host_rewrite: Option<String>,
    /// Strip this prefix from the path.
    pub strip_prefix: Option<String>,
    /// Request header edits.
    pub request_headers_rewrite: Option<HeadersRewrite>,
    /// Response header edits.
    pub response_headers_rewrite: Option<HeadersRewrite>,
}

/// Register the `rewrite` factory with the global registry.
pub fn register() {
    registry::register("rewrite", factory());
}

fn factory() -> Factory {
    Box::new(|cfg| {
        let options: RewriteConfig = match &cfg.options {
            Some(raw) => serde_json::from_value(raw.clone()).map_err(|e| {
                MiddlewareError::InvalidOptions { name: cfg.name.clone(), message: e.to_string() }
            })?,
            None => RewriteConfig::default(),
        };
        Ok(middleware(options))
    })
}

/// Build the middleware from decoded options.
#[must_use]
pub fn middleware(options: RewriteConfig) -> BoxMiddleware {
    let options = Arc::new(options);
    Arc::new(FnMiddleware(move |next: BoxTransport| {
        let options = options.clone();
        Arc::new(TransportFn(move |mut req: Request<RequestBody>| {
            let next = next.clone();
            let options = options.clone();
            async move {
                if let Some(path) = &options.path_rewrite {
                    set_path(&mut req, path)?;
                }
                if let Some(host) = &options.host_rewrite {
                    let value = HeaderValue::from_str(host).map_err(|e| {
                        janus_core::GatewayError::config(format!("invalid host rewrite: {e}"))
                    })?;
                    req.headers_mut().insert(HOST, value);
                }
                if let Some(prefix) = &options.strip_prefix {
                    let stripped = strip_prefix(req.uri().path(), prefix);
                    set_path(&mut req, &stripped)?;
                }
                if let Some(edits) = &options.request_headers_rewrite {
                    apply_header_edits(req.headers_mut(), edits);
                }
                let mut resp = next.round_trip(req).await?;
                if let Some(edits) = &options.response_headers_rewrite {
                    apply_header_edits(resp.headers_mut(), edits);
                }
                Ok(resp)
            }
        })) as BoxTransport
    }))
}

/// Strip `prefix` from `origin`, keeping the result rooted at `/`.
#[must_use]
pub fn strip_prefix(origin: &str, prefix: &str) -> String {
    let out = origin.strip_prefix(prefix).unwrap_or(origin);
    if out.is_empty() {
        return "/".to_string();
    }
    if !out.starts_with('/') {
        return format!("/{out}");
    }
    out.to_string()
}

fn apply_header_edits(headers: &mut HeaderMap, edits: &HeadersRewrite) {
    for (name, value) in &edits.set {
        if let (Ok(name), Ok(value)) =
            (name.parse::<HeaderName>(), HeaderValue::from_str(value))
        {
            headers.insert(name, value);
        }
    }
    for (name, value) in &edits.add {
        if let (Ok(name), Ok(value)) =
            (name.parse::<HeaderName>(), HeaderValue::from_str(value))
        {
            headers.append(name, value);
        }
    }
    for name in &edits.remove {
        if let Ok(name) = name.parse::<HeaderName>() {
            headers.remove(name);
        }
    }
}

fn set_path(req: &mut Request<RequestBody>, new_path: &str) -> janus_core::GatewayResult<()> {
    let mut parts = req.uri().clone().into_parts();
    let path_and_query = match req.uri().query() {
        Some(query) => format!("{new_path}?{query}"),
        None => new_path.to_string(),
    };
    parts.path_and_query = Some(path_and_query.parse::<PathAndQuery>().map_err(|e| {
        janus_core::GatewayError::config(format!("invalid rewritten path {new_path:?}: {e}"))
    })?);
    *req.uri_mut() = Uri::from_parts(parts)
        .map_err(|e| janus_core::GatewayError::config(format!("rewrite produced bad uri: {e}")))?;
    Ok(())
}

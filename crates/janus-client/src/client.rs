//! The terminal transport: selects a node and dispatches the request.

use std::sync::Arc;
use std::time::Instant;

use http::header::{HOST, LOCATION};
use http::uri::{PathAndQuery, Scheme, Uri};
use http::{Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use metrics::counter;

use janus_core::selector::{DoneInfo, Selector};
use janus_core::{GatewayError, GatewayResult};
use janus_middleware::{MetricsLabels, RequestBody, RequestOptions, ResponseBody, Transport, TransportFuture};

use crate::applier::NodeApplier;
use crate::node::Node;
use crate::pool::follow_redirect;

const MAX_REDIRECTS: usize = 10;

/// Load-balanced upstream client for one endpoint.
///
/// Implements [`Transport`] so the middleware chain composes directly on
/// top of it; closing cancels the applier's watch subscriptions.
pub struct UpstreamClient {
    applier: Arc<NodeApplier>,
    selector: Arc<dyn Selector>,
}

impl UpstreamClient {
    /// Pair an applier with its selector.
    #[must_use]
    pub fn new(applier: Arc<NodeApplier>, selector: Arc<dyn Selector>) -> Self {
        Self { applier, selector }
    }

    /// Stop the applier; watcher subscriptions are reaped later.
    pub fn close(&self) {
        self.applier.cancel();
    }
}

impl Transport for UpstreamClient {
    fn round_trip(&self, req: Request<RequestBody>) -> TransportFuture {
        let selector = self.selector.clone();
        Box::pin(async move {
            let options = RequestOptions::from_request(&req)
                .ok_or_else(|| GatewayError::config("request options missing from request"))?;

            let (node, done) = selector.select(options.filters())?;
            options.record_selection(node.address());
            let concrete = node
                .as_any()
                .downcast_ref::<Node>()
                .ok_or_else(|| GatewayError::config("selector returned a foreign node type"))?;
            let client = concrete.client().clone();
            let tls = concrete.tls();

            let (mut parts, body) = req.into_parts();
            set_authority(&mut parts.uri, node.address(), tls)?;
            // A `host` metadata entry overrides the Host header.
            if let Some(host) = node.metadata().get("host").filter(|h| !h.is_empty()) {
                if let Ok(value) = http::HeaderValue::from_str(host) {
                    parts.headers.insert(HOST, value);
                }
            }

            let labels = MetricsLabels::new(options.endpoint());
            let started = Instant::now();
            let mut hops = 0usize;
            let original_method = parts.method.clone();
            let original_headers = parts.headers.clone();
            let mut last_uri = parts.uri.clone();
            let mut current = Request::from_parts(parts, body.clone());
            let response = loop {
                let result = client.request(current).await;
                match result {
                    Err(err) => {
                        options.record_upstream(0, started.elapsed().as_secs_f64());
                        done(DoneInfo { err: Some(GatewayError::upstream(err.to_string())), reply_md: None });
                        return Err(err);
                    }
                    Ok(resp) => {
                        if !resp.status().is_redirection() {
                            break resp;
                        }
                        let Some(location) = resp.headers().get(LOCATION) else {
                            break resp;
                        };
                        redirect_incr(&labels);
                        if !follow_redirect() {
                            break resp;
                        }
                        if hops >= MAX_REDIRECTS {
                            options.record_upstream(
                                resp.status().as_u16(),
                                started.elapsed().as_secs_f64(),
                            );
                            done(DoneInfo {
                                err: Some(GatewayError::upstream("stopped after 10 redirects")),
                                reply_md: None,
                            });
                            return Err(GatewayError::upstream("stopped after 10 redirects"));
                        }
                        hops += 1;
                        current = redirected_request(
                            resp.status(),
                            location,
                            &last_uri,
                            &original_method,
                            &original_headers,
                            &body,
                        )?;
                        last_uri = current.uri().clone();
                    }
                }
            };

            options.record_upstream(response.status().as_u16(), started.elapsed().as_secs_f64());
            options.set_done(done);
            Ok(box_response(response))
        })
    }
}

fn box_response(resp: Response<Incoming>) -> Response<ResponseBody> {
    resp.map(|body| body.map_err(|e| GatewayError::upstream(e.to_string())).boxed())
}

/// Point `uri` at the selected node, keeping the path and query.
fn set_authority(uri: &mut Uri, address: &str, tls: bool) -> GatewayResult<()> {
    let mut parts = uri.clone().into_parts();
    parts.scheme = Some(if tls { Scheme::HTTPS } else { Scheme::HTTP });
    parts.authority = Some(
        address
            .parse()
            .map_err(|e| GatewayError::upstream(format!("bad node address {address:?}: {e}")))?,
    );
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some(PathAndQuery::from_static("/"));
    }
    *uri = Uri::from_parts(parts)
        .map_err(|e| GatewayError::upstream(format!("uri rewrite failed: {e}")))?;
    Ok(())
}

fn redirect_incr(labels: &MetricsLabels) {
    counter!(
        "go_gateway_client_redirect_total",
        "protocol" => labels.protocol(),
        "method" => labels.method().to_string(),
        "path" => labels.path().to_string(),
        "service" => labels.service().to_string(),
        "basePath" => labels.base_path().to_string(),
    )
    .increment(1);
}

fn redirected_request(
    status: StatusCode,
    location: &http::HeaderValue,
    base: &Uri,
    method: &http::Method,
    headers: &http::HeaderMap,
    body: &RequestBody,
) -> GatewayResult<Request<RequestBody>> {
    let location = location
        .to_str()
        .map_err(|e| GatewayError::upstream(format!("bad redirect location: {e}")))?;
    let mut uri: Uri = location
        .parse()
        .map_err(|e| GatewayError::upstream(format!("bad redirect location {location:?}: {e}")))?;
    // Relative locations inherit the scheme and authority of the request
    // being redirected.
    if uri.authority().is_none() {
        let mut parts = uri.into_parts();
        parts.scheme = base.scheme().cloned();
        parts.authority = base.authority().cloned();
        uri = Uri::from_parts(parts)
            .map_err(|e| GatewayError::upstream(format!("bad redirect location: {e}")))?;
    }
    // 301/302/303 downgrade non-idempotent requests to a bodyless GET;
    // 307/308 replay the request as-is.
    let downgrade = matches!(
        status,
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::SEE_OTHER
    ) && *method != http::Method::GET
        && *method != http::Method::HEAD;
    let (method, body) = if downgrade {
        (http::Method::GET, RequestBody::default())
    } else {
        (method.clone(), body.clone())
    };
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(out_headers) = builder.headers_mut() {
        for (name, value) in headers {
            if name != &HOST {
                out_headers.append(name.clone(), value.clone());
            }
        }
    }
    builder
        .body(body)
        .map_err(|e| GatewayError::upstream(format!("redirect request build failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_authority_rewrites_scheme_and_host() {
        let mut uri: Uri = "/echo?x=1".parse().unwrap();
        set_authority(&mut uri, "10.0.0.1:8000", false).unwrap();
        assert_eq!(uri.to_string(), "http://10.0.0.1:8000/echo?x=1");

        let mut uri: Uri = "/echo".parse().unwrap();
        set_authority(&mut uri, "10.0.0.1:8443", true).unwrap();
        assert_eq!(uri.to_string(), "https://10.0.0.1:8443/echo");
    }

    #[test]
    fn test_set_authority_defaults_path() {
        let mut uri = Uri::default();
        set_authority(&mut uri, "10.0.0.1:8000", false).unwrap();
        assert_eq!(uri.to_string(), "http://10.0.0.1:8000/");
    }

    #[test]
    fn test_set_authority_rejects_garbage() {
        let mut uri: Uri = "/echo".parse().unwrap();
        assert!(set_authority(&mut uri, "not a host", false).is_err());
    }

    #[test]
    fn test_redirect_downgrades_post_to_get() {
        let body = RequestBody::new(bytes::Bytes::from_static(b"payload"));
        let location = http::HeaderValue::from_static("http://10.0.0.2:8000/moved");
        let headers = http::HeaderMap::new();
        let base: Uri = "http://10.0.0.1:8000/orig".parse().unwrap();
        let req = redirected_request(
            StatusCode::MOVED_PERMANENTLY,
            &location,
            &base,
            &http::Method::POST,
            &headers,
            &body,
        )
        .unwrap();
        assert_eq!(req.uri().to_string(), "http://10.0.0.2:8000/moved");
        assert_eq!(req.method(), http::Method::GET);
    }

    #[test]
    fn test_redirect_resolves_relative_location() {
        let body = RequestBody::default();
        let location = http::HeaderValue::from_static("/moved");
        let base: Uri = "http://10.0.0.1:8000/orig".parse().unwrap();
        let req = redirected_request(
            StatusCode::FOUND,
            &location,
            &base,
            &http::Method::GET,
            &http::HeaderMap::new(),
            &body,
        )
        .unwrap();
        assert_eq!(req.uri().to_string(), "http://10.0.0.1:8000/moved");
    }

    #[test]
    fn test_redirect_replays_temporary_redirect() {
        let body = RequestBody::new(bytes::Bytes::from_static(b"payload"));
        let location = http::HeaderValue::from_static("http://10.0.0.2:8000/again");
        let mut headers = http::HeaderMap::new();
        headers.insert("x-keep", http::HeaderValue::from_static("yes"));
        headers.insert(HOST, http::HeaderValue::from_static("drop.me"));
        let base: Uri = "http://10.0.0.1:8000/orig".parse().unwrap();
        let req = redirected_request(
            StatusCode::TEMPORARY_REDIRECT,
            &location,
            &base,
            &http::Method::POST,
            &headers,
            &body,
        )
        .unwrap();
        assert_eq!(req.method(), http::Method::POST);
        assert_eq!(req.headers().get("x-keep").unwrap(), "yes");
        assert!(req.headers().get(HOST).is_none());
    }
}

//! JSON-over-HTTP ⇄ unary gRPC transcoding middleware.
//!
//! Active only on gRPC endpoints when the inbound request is *not* already
//! speaking gRPC (`Content-Type: application/grpc…`). Requests gain the
//! 5-byte length-prefixed frame and a `application/grpc+<subtype>` content
//! type; responses are unframed, their HTTP/2 trailers flattened into
//! headers, and non-zero `grpc-status` results become a synthetic `200`
//! carrying the JSON-encoded `google.rpc.Status`.

use std::sync::Arc;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderValue, Request, Response};
use http_body_util::{BodyExt, Full};
use prost::Message;
use serde::Serialize;

use janus_core::config::Protocol;
use janus_core::{GatewayError, GatewayResult};

use crate::registry::{self, Factory};
use crate::request::RequestOptions;
use crate::transport::{
    full_body, BoxMiddleware, BoxTransport, FnMiddleware, RequestBody, ResponseBody, TransportFn,
};

/// `google.rpc.Status` as carried in `grpc-status-details-bin`.
#[derive(Clone, PartialEq, Message)]
pub struct RpcStatus {
    /// Canonical gRPC status code.
    #[prost(int32, tag = "1")]
    pub code: i32,
    /// Developer-facing message.
    #[prost(string, tag = "2")]
    pub message: String,
    /// Detail payloads.
    #[prost(message, repeated, tag = "3")]
    pub details: Vec<prost_types::Any>,
}

#[derive(Serialize)]
struct StatusJson<'a> {
    code: i32,
    message: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    details: Vec<AnyJson>,
}

#[derive(Serialize)]
struct AnyJson {
    #[serde(rename = "@type")]
    type_url: String,
    value: String,
}

/// Register the `transcoder` factory with the global registry.
pub fn register() {
    registry::register("transcoder", factory());
}

fn factory() -> Factory {
    Box::new(|_cfg| Ok(middleware()))
}

/// Build the transcoding middleware.
#[must_use]
pub fn middleware() -> BoxMiddleware {
    Arc::new(FnMiddleware(|next: BoxTransport| {
        Arc::new(TransportFn(move |req: Request<RequestBody>| {
            let next = next.clone();
            async move { transcode(next, req).await }
        })) as BoxTransport
    }))
}

async fn transcode(
    next: BoxTransport,
    req: Request<RequestBody>,
) -> GatewayResult<Response<ResponseBody>> {
    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let is_grpc_endpoint = RequestOptions::from_request(&req)
        .map(|o| o.endpoint().protocol == Protocol::Grpc)
        .unwrap_or(false);
    if !is_grpc_endpoint || content_type.starts_with("application/grpc") {
        return next.round_trip(req).await;
    }

    // Frame the JSON body: flag byte 0, 4-byte big-endian length, payload.
    let (mut parts, body) = req.into_parts();
    let payload = body
        .collect()
        .await
        .map_err(|never| match never {})?
        .to_bytes();
    let mut framed = BytesMut::with_capacity(payload.len() + 5);
    framed.put_u8(0);
    framed.put_u32(payload.len() as u32);
    framed.extend_from_slice(&payload);

    let subtype = content_type
        .strip_prefix("application/")
        .unwrap_or(content_type.as_str());
    let outbound_type = if subtype.is_empty() {
        "application/grpc".to_string()
    } else {
        format!("application/grpc+{subtype}")
    };
    parts.headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_str(&outbound_type)
            .map_err(|e| GatewayError::upstream(format!("bad grpc content type: {e}")))?,
    );
    parts.headers.remove(CONTENT_LENGTH);
    let req = Request::from_parts(parts, Full::new(framed.freeze()));

    let resp = next.round_trip(req).await?;
    let (mut parts, body) = resp.into_parts();
    let collected = body.collect().await?;
    // Trailers ride in data frames for HTTP/1.1 clients; fold them into the
    // headers and drop the announcement.
    if let Some(trailers) = collected.trailers() {
        for (name, value) in trailers {
            parts.headers.insert(name.clone(), value.clone());
        }
    }
    parts.headers.remove(http::header::TRAILER);
    let data = collected.to_bytes();
    parts.headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .map_err(|e| GatewayError::upstream(format!("bad content type: {e}")))?,
    );

    let grpc_status = parts
        .headers
        .get("grpc-status")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("0");
    if grpc_status != "0" {
        let code: i32 = grpc_status
            .parse()
            .map_err(|_| GatewayError::upstream(format!("bad grpc-status: {grpc_status:?}")))?;
        let mut status = RpcStatus {
            code,
            message: parts
                .headers
                .get("grpc-message")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string(),
            details: Vec::new(),
        };
        if let Some(details) = parts
            .headers
            .get("grpc-status-details-bin")
            .and_then(|v| v.to_str().ok())
        {
            let blob = decode_bin_header(details)?;
            status
                .merge(blob.as_slice())
                .map_err(|e| GatewayError::upstream(format!("bad status details: {e}")))?;
        }
        let json = serde_json::to_vec(&StatusJson {
            code: status.code,
            message: &status.message,
            details: status
                .details
                .iter()
                .map(|any| AnyJson {
                    type_url: any.type_url.clone(),
                    value: STANDARD.encode(&any.value),
                })
                .collect(),
        })
        .map_err(|e| GatewayError::upstream(format!("status encode failed: {e}")))?;
        parts.status = http::StatusCode::OK;
        parts.headers.remove(CONTENT_LENGTH);
        return Ok(Response::from_parts(parts, full_body(json)));
    }

    if data.len() < 5 {
        return Err(GatewayError::upstream(format!(
            "grpc response frame too short: {} bytes",
            data.len()
        )));
    }
    parts.headers.remove(CONTENT_LENGTH);
    Ok(Response::from_parts(parts, full_body(data.slice(5..))))
}

/// Decode a `-bin` header value: standard base64 when padded to a multiple
/// of four, raw (unpadded) standard base64 otherwise.
pub fn decode_bin_header(value: &str) -> GatewayResult<Vec<u8>> {
    let decoded = if value.len() % 4 == 0 {
        STANDARD.decode(value)
    } else {
        STANDARD_NO_PAD.decode(value)
    };
    decoded.map_err(|e| GatewayError::upstream(format!("bad binary header: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use janus_core::config::Endpoint;

    fn grpc_request(body: &'static str) -> Request<RequestBody> {
        let mut req = Request::builder()
            .method("POST")
            .uri("/pkg.Service/Method")
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from_static(body.as_bytes())))
            .unwrap();
        let endpoint = Arc::new(Endpoint { protocol: Protocol::Grpc, ..Endpoint::default() });
        RequestOptions::new(endpoint).install(&mut req);
        req
    }

    fn upstream_ok(reply: &'static [u8]) -> (BoxTransport, Arc<std::sync::Mutex<Option<(String, Bytes)>>>) {
        let seen = Arc::new(std::sync::Mutex::new(None));
        let sink = seen.clone();
        let transport = Arc::new(TransportFn(move |req: Request<RequestBody>| {
            let sink = sink.clone();
            async move {
                let ct = req
                    .headers()
                    .get(CONTENT_TYPE)
                    .unwrap()
                    .to_str()
                    .unwrap()
                    .to_string();
                let body = req.into_body().collect().await.unwrap().to_bytes();
                *sink.lock().unwrap() = Some((ct, body));
                Ok(Response::builder()
                    .header(CONTENT_TYPE, "application/grpc+json")
                    .header("grpc-status", "0")
                    .body(full_body(Bytes::from_static(reply)))
                    .unwrap())
            }
        })) as BoxTransport;
        (transport, seen)
    }

    #[tokio::test]
    async fn test_request_is_framed_and_retyped() {
        let (transport, seen) = upstream_ok(b"\x00\x00\x00\x00\x02{}");
        let chain = middleware().wrap(transport);
        chain.round_trip(grpc_request("{\"x\":1}")).await.unwrap();

        let (content_type, body) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(content_type, "application/grpc+json");
        // Frame: flag 0, length 7 big-endian, then the JSON payload.
        assert_eq!(&body[..5], &[0, 0, 0, 0, 7]);
        assert_eq!(&body[5..], b"{\"x\":1}");
    }

    #[tokio::test]
    async fn test_response_frame_is_stripped() {
        let (transport, _) = upstream_ok(b"\x00\x00\x00\x00\x02{}");
        let chain = middleware().wrap(transport);
        let resp = chain.round_trip(grpc_request("{}")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"{}");
    }

    #[tokio::test]
    async fn test_grpc_error_becomes_status_json() {
        let transport = Arc::new(TransportFn(|_req: Request<RequestBody>| async {
            Ok(Response::builder()
                .header(CONTENT_TYPE, "application/grpc+json")
                .header("grpc-status", "5")
                .header("grpc-message", "nope")
                .body(full_body(Bytes::new()))
                .unwrap())
        })) as BoxTransport;
        let chain = middleware().wrap(transport);
        let resp = chain.round_trip(grpc_request("{\"x\":1}")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["code"], 5);
        assert_eq!(parsed["message"], "nope");
    }

    #[tokio::test]
    async fn test_grpc_passthrough_when_already_grpc() {
        let transport = Arc::new(TransportFn(|req: Request<RequestBody>| async move {
            // Body must arrive untouched.
            let body = req.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(&body[..], b"raw-frame");
            Ok(Response::new(full_body("ok")))
        })) as BoxTransport;
        let chain = middleware().wrap(transport);
        let mut req = grpc_request("raw-frame");
        req.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
        chain.round_trip(req).await.unwrap();
    }

    #[test]
    fn test_decode_bin_header_both_paddings() {
        let blob = b"hello-world";
        let padded = STANDARD.encode(blob);
        let raw = STANDARD_NO_PAD.encode(blob);
        assert_eq!(decode_bin_header(&padded).unwrap(), blob);
        assert_eq!(decode_bin_header(&raw).unwrap(), blob);
        assert!(decode_bin_header("!!!not-base64!!!").is_err());
    }

    #[test]
    fn test_status_details_merge() {
        // A serialized RpcStatus with a richer message overrides the header.
        let wire = RpcStatus { code: 5, message: "detailed".into(), details: Vec::new() }
            .encode_to_vec();
        let mut status = RpcStatus { code: 5, message: "terse".into(), details: Vec::new() };
        status.merge(wire.as_slice()).unwrap();
        assert_eq!(status.message, "detailed");
    }
}

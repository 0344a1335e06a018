//! Transport and middleware traits.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};

use janus_core::{GatewayError, GatewayResult};

/// Outbound request body. The retry orchestrator materialises the captured
/// inbound body into one of these per attempt.
pub type RequestBody = Full<Bytes>;

/// Upstream response body: streamed from the backend or synthesised by a
/// middleware, trailer-capable either way.
pub type ResponseBody = BoxBody<Bytes, GatewayError>;

/// Boxed future returned by [`Transport::round_trip`].
pub type TransportFuture = Pin<Box<dyn Future<Output = GatewayResult<Response<ResponseBody>>> + Send>>;

/// Something that forwards a request upstream and returns the response.
///
/// The terminal transport is the endpoint's load-balanced client; every
/// middleware is a transport that delegates to the next one.
pub trait Transport: Send + Sync {
    /// Forward `req` and resolve to the upstream response.
    fn round_trip(&self, req: Request<RequestBody>) -> TransportFuture;
}

/// Shared transport handle used for composition.
pub type BoxTransport = Arc<dyn Transport>;

/// Adapter turning an async closure into a [`Transport`].
pub struct TransportFn<F>(pub F);

impl<F, Fut> Transport for TransportFn<F>
where
    F: Fn(Request<RequestBody>) -> Fut + Send + Sync,
    Fut: Future<Output = GatewayResult<Response<ResponseBody>>> + Send + 'static,
{
    fn round_trip(&self, req: Request<RequestBody>) -> TransportFuture {
        Box::pin((self.0)(req))
    }
}

/// A middleware: wraps the next transport and optionally owns resources
/// released through [`Middleware::close`] when its pipeline is torn down.
pub trait Middleware: Send + Sync {
    /// Wrap `next`, returning the transport requests will enter through.
    fn wrap(&self, next: BoxTransport) -> BoxTransport;

    /// Release resources held by this middleware. Default: nothing to do.
    fn close(&self) {}
}

/// Shared middleware handle.
pub type BoxMiddleware = Arc<dyn Middleware>;

/// Stateless middleware built from a wrapping function.
pub struct FnMiddleware<F>(pub F);

impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(BoxTransport) -> BoxTransport + Send + Sync,
{
    fn wrap(&self, next: BoxTransport) -> BoxTransport {
        (self.0)(next)
    }
}

/// Pairs a wrapping function with a teardown hook.
pub struct WithCloser<F, C> {
    process: F,
    closer: C,
}

impl<F, C> WithCloser<F, C> {
    /// Combine a wrapping function and a close hook into one middleware.
    pub fn new(process: F, closer: C) -> Self {
        Self { process, closer }
    }
}

impl<F, C> Middleware for WithCloser<F, C>
where
    F: Fn(BoxTransport) -> BoxTransport + Send + Sync,
    C: Fn() + Send + Sync,
{
    fn wrap(&self, next: BoxTransport) -> BoxTransport {
        (self.process)(next)
    }

    fn close(&self) {
        (self.closer)();
    }
}

/// The identity middleware substituted for optional factories that fail.
pub struct IdentityMiddleware;

impl Middleware for IdentityMiddleware {
    fn wrap(&self, next: BoxTransport) -> BoxTransport {
        next
    }
}

/// Box a fully buffered body.
#[must_use]
pub fn full_body(data: impl Into<Bytes>) -> ResponseBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

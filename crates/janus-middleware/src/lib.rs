//! Middleware framework for the Janus gateway.
//!
//! A middleware wraps a [`Transport`], the abstraction over "something
//! that forwards a request upstream and returns a response", and yields a
//! new transport. Endpoint pipelines are built by composing middlewares in
//! reverse configuration order so the first configured middleware is the
//! outermost: first to see the request, last to see the response.
//!
//! Factories are looked up by name in the [`registry`]; each factory
//! consumes the opaque options blob of its [`MiddlewareConfig`] entry.
//! Built-in middlewares:
//!
//! - [`rewrite`], path/host/prefix/header rewriting
//! - [`transcoder`], JSON-over-HTTP ⇄ unary gRPC framing
//! - [`trace`], per-attempt client spans with W3C propagation
//! - [`logging`], upstream access logging

pub mod logging;
pub mod registry;
pub mod request;
pub mod rewrite;
pub mod trace;
pub mod transcoder;
mod transport;

pub use registry::{register, MiddlewareError, MiddlewareRegistry, MiddlewareResult};
pub use request::{MetricsLabels, RequestOptions};
pub use transport::{
    full_body, BoxMiddleware, BoxTransport, FnMiddleware, Middleware, RequestBody, ResponseBody,
    Transport, TransportFn, TransportFuture, WithCloser,
};

/// Register every built-in middleware with the global registry.
///
/// Idempotent; the binary calls this once before the first config load.
pub fn register_builtin() {
    rewrite::register();
    transcoder::register();
    trace::register();
    logging::register();
}

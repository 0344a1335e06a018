//! Core types shared across the Janus gateway.
//!
//! This crate holds everything the other gateway crates agree on:
//!
//! - The [`config`] model describing a gateway generation (endpoints,
//!   backends, retry policies, middlewares, TLS store).
//! - The [`GatewayError`] taxonomy with its HTTP and gRPC status mappings.
//! - Process-wide [`features`] flags toggleable at runtime.
//!
//! Nothing in here does I/O; the crate is deliberately small so that every
//! other crate in the workspace can depend on it without dragging in the
//! HTTP stack.

pub mod config;
pub mod duration;
pub mod error;
pub mod features;
pub mod net;
pub mod selector;

pub use config::{
    Backend, Endpoint, Gateway, MiddlewareConfig, Protocol, Retry, RetryConditionConfig,
    TlsStoreEntry,
};
pub use error::{GatewayError, GatewayResult};
pub use selector::{DoneFunc, DoneInfo, Node, NodeFilter, ReplyMd, Selector};

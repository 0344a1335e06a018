//! Proxy orchestrator for the Janus gateway.
//!
//! Owns the active [`janus_router::Router`] behind an atomic cell, builds
//! per-endpoint handler pipelines from configuration (client → endpoint
//! middlewares → global middlewares → retry/timeout orchestration) and
//! swaps routing tables wholesale on every config update. The previous
//! table is drained and its resources closed in the background.

pub mod breaker;
pub mod condition;
pub mod debug;
mod proxy;
pub mod retry;

pub use proxy::{MiddlewareFactory, Proxy};

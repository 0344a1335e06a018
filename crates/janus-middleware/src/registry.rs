//! Name-keyed middleware factory registry.
//!
//! Factories are registered under `gateway.middleware.<name>` (lowercased)
//! and invoked with the raw [`MiddlewareConfig`] during endpoint builds.
//! Creation semantics follow the endpoint-build contract:
//!
//! - unknown name → [`MiddlewareError::NotFound`]; the proxy logs and skips
//! - `required: true` + factory failure → error, the endpoint build fails
//! - optional factory failure → identity middleware substituted and
//!   `failed_middleware_create{name,required}` incremented

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use metrics::counter;
use thiserror::Error;

use janus_core::config::MiddlewareConfig;

use crate::transport::{BoxMiddleware, IdentityMiddleware};

/// Result alias for factory invocations.
pub type MiddlewareResult<T> = Result<T, MiddlewareError>;

/// Errors from middleware lookup and creation.
#[derive(Error, Debug)]
pub enum MiddlewareError {
    /// The name has no registered factory.
    #[error("middleware {name} has not been registered")]
    NotFound {
        /// The unknown middleware name.
        name: String,
    },

    /// The options blob could not be interpreted.
    #[error("invalid options for middleware {name}: {message}")]
    InvalidOptions {
        /// Middleware name.
        name: String,
        /// Decode failure detail.
        message: String,
    },

    /// The factory ran but could not build the middleware.
    #[error("failed to create middleware {name}: {message}")]
    CreateFailed {
        /// Middleware name.
        name: String,
        /// Factory failure detail.
        message: String,
    },
}

impl MiddlewareError {
    /// True when the error is an unknown-name lookup miss.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// A middleware factory: consumes the config entry, yields the middleware.
pub type Factory = Box<dyn Fn(&MiddlewareConfig) -> MiddlewareResult<BoxMiddleware> + Send + Sync>;

/// Registry mapping full middleware names to factories.
pub struct MiddlewareRegistry {
    factories: Mutex<HashMap<String, Factory>>,
}

fn full_name(name: &str) -> String {
    format!("gateway.middleware.{name}").to_ascii_lowercase()
}

impl MiddlewareRegistry {
    /// An empty registry; tests use this to avoid the global one.
    #[must_use]
    pub fn new() -> Self {
        Self { factories: Mutex::new(HashMap::new()) }
    }

    /// Register a factory under `gateway.middleware.<name>`.
    pub fn register(&self, name: &str, factory: Factory) {
        self.factories
            .lock()
            .expect("middleware registry poisoned")
            .insert(full_name(name), factory);
    }

    /// Create the middleware described by `cfg`.
    ///
    /// # Errors
    ///
    /// [`MiddlewareError::NotFound`] for unknown names; factory errors only
    /// when the config marks the middleware required.
    pub fn create(&self, cfg: &MiddlewareConfig) -> MiddlewareResult<BoxMiddleware> {
        let factories = self.factories.lock().expect("middleware registry poisoned");
        let Some(factory) = factories.get(&full_name(&cfg.name)) else {
            return Err(MiddlewareError::NotFound { name: cfg.name.clone() });
        };
        match factory(cfg) {
            Ok(instance) => Ok(instance),
            Err(err) if cfg.required => {
                counter!(
                    "go_gateway_failed_middleware_create",
                    "name" => cfg.name.clone(),
                    "required" => "true"
                )
                .increment(1);
                tracing::error!(
                    name = %cfg.name,
                    error = %err,
                    "failed to create required middleware"
                );
                Err(err)
            }
            Err(err) => {
                counter!(
                    "go_gateway_failed_middleware_create",
                    "name" => cfg.name.clone(),
                    "required" => "false"
                )
                .increment(1);
                tracing::error!(
                    name = %cfg.name,
                    error = %err,
                    "failed to create optional middleware, substituting identity"
                );
                Ok(Arc::new(IdentityMiddleware))
            }
        }
    }
}

impl Default for MiddlewareRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide registry the built-in middlewares register with.
pub fn global() -> &'static MiddlewareRegistry {
    static GLOBAL: OnceLock<MiddlewareRegistry> = OnceLock::new();
    GLOBAL.get_or_init(MiddlewareRegistry::new)
}

/// Register a factory with the global registry.
pub fn register(name: &str, factory: Factory) {
    global().register(name, factory);
}

/// Create a middleware from the global registry.
pub fn create(cfg: &MiddlewareConfig) -> MiddlewareResult<BoxMiddleware> {
    global().create(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FnMiddleware;

    fn ok_factory() -> Factory {
        Box::new(|_cfg| Ok(Arc::new(FnMiddleware(|next| next)) as BoxMiddleware))
    }

    fn failing_factory() -> Factory {
        Box::new(|cfg| {
            Err(MiddlewareError::CreateFailed {
                name: cfg.name.clone(),
                message: "boom".into(),
            })
        })
    }

    fn cfg(name: &str, required: bool) -> MiddlewareConfig {
        MiddlewareConfig { name: name.into(), required, options: None }
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let registry = MiddlewareRegistry::new();
        registry.register("Rewrite", ok_factory());
        assert!(registry.create(&cfg("rewrite", false)).is_ok());
        assert!(registry.create(&cfg("REWRITE", false)).is_ok());
    }

    #[test]
    fn test_unknown_name_is_not_found() {
        let registry = MiddlewareRegistry::new();
        let err = registry.create(&cfg("nope", false)).err().unwrap();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_required_failure_propagates() {
        let registry = MiddlewareRegistry::new();
        registry.register("flaky", failing_factory());
        assert!(registry.create(&cfg("flaky", true)).is_err());
    }

    #[test]
    fn test_optional_failure_substitutes_identity() {
        let registry = MiddlewareRegistry::new();
        registry.register("flaky", failing_factory());
        let mw = registry.create(&cfg("flaky", false)).unwrap();
        // The identity middleware hands back the same transport.
        let marker = Arc::new(crate::transport::TransportFn(
            |_req: http::Request<crate::transport::RequestBody>| async {
                Ok(http::Response::new(crate::transport::full_body("x")))
            },
        )) as crate::transport::BoxTransport;
        let wrapped = mw.wrap(marker.clone());
        assert!(Arc::ptr_eq(&marker, &wrapped));
    }
}

//! Error taxonomy for the gateway.
//!
//! Every failure that can surface on the proxy path is classified into one
//! of the [`GatewayError`] variants, each with a fixed HTTP status mapping:
//!
//! | Variant | Status |
//! |---|---|
//! | `Canceled` | 499 |
//! | `DeadlineExceeded` | 504 |
//! | `Upstream` | 502 |
//! | `NoInstances` | 502 |
//! | `BreakerOpen` | 502 |
//! | `NotFound` | 404 |
//! | `MethodNotAllowed` | 405 |
//! | `InvalidConfig` | 500 |
//! | `Panic` | 502 |
//!
//! For gRPC endpoints the HTTP status is additionally translated to a
//! canonical gRPC code via [`grpc_code_for_status`].

use http::StatusCode;
use thiserror::Error;

/// Result type alias using [`GatewayError`].
pub type GatewayResult<T> = Result<T, GatewayError>;

/// HTTP status 499: client closed the connection before a response was sent.
///
/// Not part of any RFC, but universally understood by proxies.
pub const STATUS_CLIENT_CLOSED_REQUEST: u16 = 499;

/// Standard error type for the gateway data path.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The inbound request was canceled (client disconnect or context drop).
    #[error("client canceled: {message}")]
    Canceled {
        /// Human-readable cause.
        message: String,
    },

    /// The total or per-attempt deadline elapsed.
    #[error("deadline exceeded: {message}")]
    DeadlineExceeded {
        /// Which deadline fired.
        message: String,
    },

    /// Transport-level upstream failure (dial, TLS, malformed response).
    #[error("upstream error: {message}")]
    Upstream {
        /// Underlying transport error.
        message: String,
    },

    /// The selector had no candidate nodes.
    #[error("no instances available for endpoint {endpoint}")]
    NoInstances {
        /// Endpoint identity the selection ran for.
        endpoint: String,
    },

    /// The adaptive breaker refused a retry attempt.
    #[error("retry refused by circuit breaker")]
    BreakerOpen,

    /// No route matched the request path.
    #[error("no route matched {path}")]
    NotFound {
        /// The cleaned request path.
        path: String,
    },

    /// A route matched but the method is not registered for it.
    #[error("method {method} not allowed")]
    MethodNotAllowed {
        /// The offending method.
        method: String,
    },

    /// A configuration entry could not be interpreted.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// What was wrong.
        message: String,
    },

    /// A panic was recovered on the request path.
    #[error("panic recovered: {message}")]
    Panic {
        /// Panic payload rendered to a string.
        message: String,
    },
}

impl GatewayError {
    /// Shorthand for a [`GatewayError::Canceled`].
    pub fn canceled(message: impl Into<String>) -> Self {
        Self::Canceled { message: message.into() }
    }

    /// Shorthand for a [`GatewayError::DeadlineExceeded`].
    pub fn deadline(message: impl Into<String>) -> Self {
        Self::DeadlineExceeded { message: message.into() }
    }

    /// Shorthand for a [`GatewayError::Upstream`].
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream { message: message.into() }
    }

    /// Shorthand for a [`GatewayError::InvalidConfig`].
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig { message: message.into() }
    }

    /// The HTTP status this error maps to on the inbound side.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Canceled { .. } => {
                StatusCode::from_u16(STATUS_CLIENT_CLOSED_REQUEST).expect("499 is a valid status")
            }
            Self::DeadlineExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Upstream { .. } | Self::NoInstances { .. } | Self::BreakerOpen | Self::Panic { .. } => {
                StatusCode::BAD_GATEWAY
            }
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Self::InvalidConfig { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this error is a cancellation.
    ///
    /// Cancellations are special on the retry path: they never count as
    /// breaker failures and never trigger another attempt.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Canceled { .. })
    }
}

/// Canonical HTTP → gRPC status code mapping.
///
/// See <https://github.com/googleapis/googleapis/blob/master/google/rpc/code.proto>.
#[must_use]
pub fn grpc_code_for_status(status: StatusCode) -> i32 {
    match status.as_u16() {
        200 => 0,                                // OK
        400 => 3,                                // INVALID_ARGUMENT
        401 => 16,                               // UNAUTHENTICATED
        403 => 7,                                // PERMISSION_DENIED
        404 => 5,                                // NOT_FOUND
        409 => 10,                               // ABORTED
        429 => 8,                                // RESOURCE_EXHAUSTED
        STATUS_CLIENT_CLOSED_REQUEST => 1,       // CANCELLED
        500 => 13,                               // INTERNAL
        501 => 12,                               // UNIMPLEMENTED
        503 => 14,                               // UNAVAILABLE
        504 => 4,                                // DEADLINE_EXCEEDED
        _ => 2,                                  // UNKNOWN
    }
}

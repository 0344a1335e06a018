//! Retry strategy derivation.
//!
//! Defaults mirror the endpoint contract: one attempt unless configured,
//! total timeout 1s when unset, per-attempt timeout falling back to the
//! endpoint timeout and then 1s. Retries as a whole sit behind the
//! `gw:Retry` feature flag.

use std::time::Duration;

use janus_core::config::Endpoint;
use janus_core::{features, GatewayResult};

use crate::condition::{parse_conditions, Condition};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Runtime flag gating every attempt after the first.
pub fn retry_feature() -> &'static features::Feature {
    static FLAG: std::sync::OnceLock<&'static features::Feature> = std::sync::OnceLock::new();
    FLAG.get_or_init(|| features::register("gw:Retry", true))
}

/// The per-endpoint retry plan.
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    /// Attempt budget, including the first attempt. Always ≥ 1.
    pub attempts: usize,
    /// Total deadline across all attempts.
    pub timeout: Duration,
    /// Deadline for each attempt.
    pub per_try_timeout: Duration,
    /// Conditions demanding another attempt.
    pub conditions: Vec<Condition>,
}

fn calc_timeout(endpoint: &Endpoint) -> Duration {
    match endpoint.timeout {
        Some(timeout) if !timeout.is_zero() => timeout,
        _ => DEFAULT_TIMEOUT,
    }
}

fn calc_attempts(endpoint: &Endpoint) -> usize {
    match &endpoint.retry {
        Some(retry) if retry.attempts > 0 => retry.attempts as usize,
        _ => 1,
    }
}

fn calc_per_try_timeout(endpoint: &Endpoint) -> Duration {
    let configured = endpoint
        .retry
        .as_ref()
        .and_then(|r| r.per_try_timeout)
        .or(endpoint.timeout);
    match configured {
        Some(timeout) if !timeout.is_zero() => timeout,
        _ => DEFAULT_TIMEOUT,
    }
}

/// Derive the strategy for one endpoint.
///
/// # Errors
///
/// Fails when a retry condition cannot be parsed.
pub fn prepare_retry_strategy(endpoint: &Endpoint) -> GatewayResult<RetryStrategy> {
    let conditions = match &endpoint.retry {
        Some(retry) => parse_conditions(&retry.conditions)?,
        None => Vec::new(),
    };
    Ok(RetryStrategy {
        attempts: calc_attempts(endpoint),
        timeout: calc_timeout(endpoint),
        per_try_timeout: calc_per_try_timeout(endpoint),
        conditions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use janus_core::config::{Retry, RetryConditionConfig};

    #[test]
    fn test_defaults_without_retry_config() {
        let endpoint = Endpoint::default();
        let strategy = prepare_retry_strategy(&endpoint).unwrap();
        assert_eq!(strategy.attempts, 1);
        assert_eq!(strategy.timeout, Duration::from_secs(1));
        assert_eq!(strategy.per_try_timeout, Duration::from_secs(1));
        assert!(strategy.conditions.is_empty());
    }

    #[test]
    fn test_zero_attempts_means_one() {
        let endpoint = Endpoint {
            retry: Some(Retry { attempts: 0, ..Retry::default() }),
            ..Endpoint::default()
        };
        assert_eq!(prepare_retry_strategy(&endpoint).unwrap().attempts, 1);
    }

    #[test]
    fn test_per_try_falls_back_to_endpoint_timeout() {
        let endpoint = Endpoint {
            timeout: Some(Duration::from_millis(750)),
            retry: Some(Retry { attempts: 3, ..Retry::default() }),
            ..Endpoint::default()
        };
        let strategy = prepare_retry_strategy(&endpoint).unwrap();
        assert_eq!(strategy.timeout, Duration::from_millis(750));
        assert_eq!(strategy.per_try_timeout, Duration::from_millis(750));
    }

    #[test]
    fn test_explicit_configuration() {
        let endpoint = Endpoint {
            timeout: Some(Duration::from_millis(500)),
            retry: Some(Retry {
                attempts: 3,
                per_try_timeout: Some(Duration::from_millis(50)),
                conditions: vec![RetryConditionConfig::ByStatusCode("500-599".into())],
            }),
            ..Endpoint::default()
        };
        let strategy = prepare_retry_strategy(&endpoint).unwrap();
        assert_eq!(strategy.attempts, 3);
        assert_eq!(strategy.per_try_timeout, Duration::from_millis(50));
        assert_eq!(strategy.conditions.len(), 1);
    }

    #[test]
    fn test_retry_feature_defaults_on() {
        assert!(retry_feature().enabled());
    }
}

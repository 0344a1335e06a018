//! Retry conditions: predicates over the upstream response that demand
//! another attempt.

use http::{HeaderMap, StatusCode};

use janus_core::config::RetryConditionConfig;
use janus_core::{GatewayError, GatewayResult};

/// A compiled retry condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// Inclusive status range, `"500-599"`.
    StatusRange {
        /// Lower bound.
        min: u16,
        /// Upper bound.
        max: u16,
    },
    /// Explicit status list, `"501,502"` or a single code.
    StatusList(Vec<u16>),
    /// Response header equality.
    Header {
        /// Header name.
        name: String,
        /// Expected value.
        value: String,
    },
}

impl Condition {
    fn matches(&self, status: StatusCode, headers: &HeaderMap) -> bool {
        match self {
            Self::StatusRange { min, max } => {
                let code = status.as_u16();
                code >= *min && code <= *max
            }
            Self::StatusList(codes) => codes.contains(&status.as_u16()),
            Self::Header { name, value } => headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v == value),
        }
    }
}

fn parse_status(raw: &str) -> GatewayResult<u16> {
    let code: u16 = raw
        .trim()
        .parse()
        .map_err(|_| GatewayError::config(format!("invalid status code {raw:?}")))?;
    if !(100..=599).contains(&code) {
        return Err(GatewayError::config(format!("status code {code} out of range")));
    }
    Ok(code)
}

/// Compile condition configs into matchers.
pub fn parse_conditions(configs: &[RetryConditionConfig]) -> GatewayResult<Vec<Condition>> {
    let mut out = Vec::with_capacity(configs.len());
    for config in configs {
        match config {
            RetryConditionConfig::ByStatusCode(spec) => {
                if let Some((lo, hi)) = spec.split_once('-') {
                    let min = parse_status(lo)?;
                    let max = parse_status(hi)?;
                    if min > max {
                        return Err(GatewayError::config(format!(
                            "inverted status range {spec:?}"
                        )));
                    }
                    out.push(Condition::StatusRange { min, max });
                } else {
                    let codes = spec
                        .split(',')
                        .map(parse_status)
                        .collect::<GatewayResult<Vec<_>>>()?;
                    if codes.is_empty() {
                        return Err(GatewayError::config("empty status code condition"));
                    }
                    out.push(Condition::StatusList(codes));
                }
            }
            RetryConditionConfig::ByHeader { name, value } => {
                out.push(Condition::Header { name: name.clone(), value: value.clone() });
            }
        }
    }
    Ok(out)
}

/// Whether any condition demands a retry for this response.
///
/// An empty condition list never retries.
#[must_use]
pub fn judge_retry_required(
    conditions: &[Condition],
    status: StatusCode,
    headers: &HeaderMap,
) -> bool {
    conditions.iter().any(|c| c.matches(status, headers))
}

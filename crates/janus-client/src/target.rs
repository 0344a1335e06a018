//! Backend target URI parsing.

use janus_core::{GatewayError, GatewayResult};
use url::Url;

/// A parsed backend target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Routing scheme: `direct` or `discovery`.
    pub scheme: String,
    /// Authority part, `host:port` when present.
    pub authority: String,
    /// Path with the leading slash removed; the service key for
    /// `discovery://` targets.
    pub endpoint: String,
}

/// Parse a backend target string.
///
/// A string without `"://"` is treated as a bare direct address and gains
/// a `direct:///` prefix before parsing.
pub fn parse_target(raw: &str) -> GatewayResult<Target> {
    let prefixed;
    let input = if raw.contains("://") {
        raw
    } else {
        prefixed = format!("direct:///{raw}");
        &prefixed
    };
    let url = Url::parse(input)
        .map_err(|e| GatewayError::config(format!("invalid backend target {raw:?}: {e}")))?;
    let authority = match url.host_str() {
        Some(host) => match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        },
        None => String::new(),
    };
    let path = url.path();
    let endpoint = if path.len() > 1 { path[1..].to_string() } else { String::new() };
    Ok(Target { scheme: url.scheme().to_string(), authority, endpoint })
}

/// Pick the dialable authority out of a discovery instance's endpoint URIs.
///
/// The first URI whose scheme equals `scheme` and whose `isSecure` query
/// flag equals `is_secure` wins. Returns an empty string when none match.
pub fn parse_endpoint(endpoints: &[String], scheme: &str, is_secure: bool) -> GatewayResult<String> {
    for raw in endpoints {
        let url = Url::parse(raw)
            .map_err(|e| GatewayError::config(format!("invalid instance endpoint {raw:?}: {e}")))?;
        if url.scheme() == scheme && endpoint_is_secure(&url) == is_secure {
            if let Some(host) = url.host_str() {
                return Ok(match url.port() {
                    Some(port) => format!("{host}:{port}"),
                    None => host.to_string(),
                });
            }
        }
    }
    Ok(String::new())
}

/// Whether an instance endpoint URI carries `isSecure=true`.
#[must_use]
pub fn endpoint_is_secure(url: &Url) -> bool {
    url.query_pairs()
        .find(|(k, _)| k == "isSecure")
        .map(|(_, v)| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_address_is_direct() {
        let target = parse_target("127.0.0.1:9001").unwrap();
        assert_eq!(target.scheme, "direct");
        assert_eq!(target.authority, "");
        assert_eq!(target.endpoint, "127.0.0.1:9001");
    }

    #[test]
    fn test_direct_uri() {
        let target = parse_target("direct://127.0.0.1:9001").unwrap();
        assert_eq!(target.scheme, "direct");
        assert_eq!(target.authority, "127.0.0.1:9001");
        assert_eq!(target.endpoint, "");
    }

    #[test]
    fn test_discovery_uri() {
        let target = parse_target("discovery:///helloworld").unwrap();
        assert_eq!(target.scheme, "discovery");
        assert_eq!(target.endpoint, "helloworld");
    }

    #[test]
    fn test_malformed_uri_fails() {
        assert!(parse_target("http://exa mple.com").is_err());
    }

    #[test]
    fn test_parse_endpoint_matches_scheme_and_security() {
        let endpoints = vec![
            "grpc://10.0.0.1:9000".to_string(),
            "http://10.0.0.1:8000?isSecure=false".to_string(),
            "http://10.0.0.2:8443?isSecure=true".to_string(),
        ];
        assert_eq!(parse_endpoint(&endpoints, "http", false).unwrap(), "10.0.0.1:8000");
        assert_eq!(parse_endpoint(&endpoints, "http", true).unwrap(), "10.0.0.2:8443");
        assert_eq!(parse_endpoint(&endpoints, "grpc", false).unwrap(), "10.0.0.1:9000");
        assert_eq!(parse_endpoint(&endpoints, "grpc", true).unwrap(), "");
    }

    #[test]
    fn test_is_secure_defaults_false() {
        let url = Url::parse("http://10.0.0.1:8000").unwrap();
        assert!(!endpoint_is_secure(&url));
        let url = Url::parse("http://10.0.0.1:8000?isSecure=notabool").unwrap();
        assert!(!endpoint_is_secure(&url));
        let url = Url::parse("http://10.0.0.1:8000?isSecure=true").unwrap();
        assert!(endpoint_is_secure(&url));
    }
}

//! Path pattern compilation and matching.
//!
//! Four pattern shapes, chosen by inspection:
//!
//! - `/api/echo/*`: prefix match (trailing `*` stripped)
//! - `/api/echo/{name}`: template match with path parameters
//! - `/api/echo/[a-z]+`: regex match
//! - `/api/echo/hello`: exact match
//!
//! With strict-slash off (the default) a trailing slash is insignificant
//! for exact and template patterns; with it on, `/p` and `/p/` are
//! distinct.

use janus_core::{GatewayError, GatewayResult};
use regex::Regex;

/// A compiled path pattern.
#[derive(Debug)]
pub enum PathPattern {
    /// Literal comparison.
    Exact {
        /// The registered path.
        path: String,
        /// Trailing slash significant?
        strict_slash: bool,
    },
    /// `starts_with` comparison after stripping the `*`.
    Prefix {
        /// The prefix to match.
        prefix: String,
    },
    /// `{name}` template compiled to an anchored regex.
    Template {
        /// The registered template.
        raw: String,
        /// Compiled matcher.
        regex: Regex,
    },
    /// User-supplied regex, anchored.
    Regex {
        /// The registered expression.
        raw: String,
        /// Compiled matcher.
        regex: Regex,
    },
}

fn has_template_token(pattern: &str) -> bool {
    // Any brace routes through the template compiler, which rejects
    // unbalanced or malformed parameters.
    pattern.contains('{')
}

fn has_regex_meta(pattern: &str) -> bool {
    pattern
        .chars()
        .any(|c| matches!(c, '.' | '*' | '+' | '?' | '(' | ')' | '[' | ']' | '|' | '^' | '$' | '\\'))
}

impl PathPattern {
    /// Compile a pattern, honouring the strict-slash mode.
    pub fn parse(pattern: &str, strict_slash: bool) -> GatewayResult<Self> {
        if let Some(stripped) = pattern.strip_suffix('*') {
            let prefix = stripped.trim_end_matches('*').to_string();
            return Ok(Self::Prefix { prefix });
        }
        if has_template_token(pattern) {
            let regex = compile_template(pattern, strict_slash)?;
            return Ok(Self::Template { raw: pattern.to_string(), regex });
        }
        if has_regex_meta(pattern) {
            let anchored = format!("^(?:{pattern})$");
            let regex = Regex::new(&anchored).map_err(|e| {
                GatewayError::config(format!("invalid path regex {pattern:?}: {e}"))
            })?;
            return Ok(Self::Regex { raw: pattern.to_string(), regex });
        }
        Ok(Self::Exact { path: pattern.to_string(), strict_slash })
    }

    /// Whether `path` (already cleaned) matches this pattern.
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Exact { path: registered, strict_slash } => {
                if *strict_slash {
                    registered == path
                } else {
                    trim_trailing_slash(registered) == trim_trailing_slash(path)
                }
            }
            Self::Prefix { prefix } => path.starts_with(prefix.as_str()),
            Self::Template { regex, .. } | Self::Regex { regex, .. } => regex.is_match(path),
        }
    }

    /// The pattern as registered, for the inspection dump.
    #[must_use]
    pub fn template(&self) -> &str {
        match self {
            Self::Exact { path, .. } => path,
            Self::Prefix { prefix } => prefix,
            Self::Template { raw, .. } | Self::Regex { raw, .. } => raw,
        }
    }

    /// The compiled regex, when one exists.
    #[must_use]
    pub fn regex(&self) -> Option<&str> {
        match self {
            Self::Template { regex, .. } | Self::Regex { regex, .. } => Some(regex.as_str()),
            _ => None,
        }
    }
}

fn trim_trailing_slash(path: &str) -> &str {
    if path.len() > 1 { path.trim_end_matches('/') } else { path }
}

fn compile_template(pattern: &str, strict_slash: bool) -> GatewayResult<Regex> {
    let mut out = String::with_capacity(pattern.len() + 16);
    out.push('^');
    let mut rest = pattern;
    while let Some(open) = rest.find('{') {
        let (literal, tail) = rest.split_at(open);
        out.push_str(&regex::escape(literal));
        let Some(close) = tail.find('}') else {
            return Err(GatewayError::config(format!(
                "unbalanced template braces in {pattern:?}"
            )));
        };
        let name = &tail[1..close];
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(GatewayError::config(format!(
                "invalid template parameter {name:?} in {pattern:?}"
            )));
        }
        out.push_str(&format!("(?P<{name}>[^/]+)"));
        rest = &tail[close + 1..];
    }
    out.push_str(&regex::escape(rest));
    if !strict_slash {
        out.push_str("/?");
    }
    out.push('$');
    Regex::new(&out)
        .map_err(|e| GatewayError::config(format!("invalid template {pattern:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_detection() {
        assert!(matches!(
            PathPattern::parse("/api/echo/*", false).unwrap(),
            PathPattern::Prefix { .. }
        ));
        assert!(matches!(
            PathPattern::parse("/api/echo/{name}", false).unwrap(),
            PathPattern::Template { .. }
        ));
        assert!(matches!(
            PathPattern::parse("/api/echo/[a-z]+", false).unwrap(),
            PathPattern::Regex { .. }
        ));
        assert!(matches!(
            PathPattern::parse("/api/echo/hello", false).unwrap(),
            PathPattern::Exact { .. }
        ));
    }

    #[test]
    fn test_exact_matching() {
        let pattern = PathPattern::parse("/api/echo", false).unwrap();
        assert!(pattern.matches("/api/echo"));
        assert!(pattern.matches("/api/echo/"));
        assert!(!pattern.matches("/api/echoes"));

        let strict = PathPattern::parse("/api/echo", true).unwrap();
        assert!(strict.matches("/api/echo"));
        assert!(!strict.matches("/api/echo/"));
    }

    #[test]
    fn test_prefix_matching() {
        let pattern = PathPattern::parse("/api/echo/*", false).unwrap();
        assert!(pattern.matches("/api/echo/"));
        assert!(pattern.matches("/api/echo/deep/nested"));
        assert!(!pattern.matches("/api/other"));
    }

    #[test]
    fn test_template_matching() {
        let pattern = PathPattern::parse("/users/{id}/posts/{post_id}", false).unwrap();
        assert!(pattern.matches("/users/42/posts/7"));
        assert!(!pattern.matches("/users/42/posts"));
        assert!(!pattern.matches("/users/42/posts/7/comments"));
        // Parameters never span segments.
        assert!(!pattern.matches("/users/a/b/posts/7"));
    }

    #[test]
    fn test_regex_matching() {
        let pattern = PathPattern::parse("/api/v[0-9]+/status", false).unwrap();
        assert!(pattern.matches("/api/v1/status"));
        assert!(pattern.matches("/api/v22/status"));
        assert!(!pattern.matches("/api/vx/status"));
        // Anchored: no partial matches.
        assert!(!pattern.matches("/prefix/api/v1/status"));
    }

    #[test]
    fn test_template_rejects_bad_parameters() {
        assert!(PathPattern::parse("/users/{", false).is_err());
        assert!(PathPattern::parse("/users/{bad name}", false).is_err());
    }

    #[test]
    fn test_inspection_accessors() {
        let pattern = PathPattern::parse("/users/{id}", false).unwrap();
        assert_eq!(pattern.template(), "/users/{id}");
        assert!(pattern.regex().unwrap().contains("(?P<id>"));
        let exact = PathPattern::parse("/ping", false).unwrap();
        assert!(exact.regex().is_none());
    }
}

//! URL path normalisation.

/// Clean a request path before matching.
///
/// - empty input becomes `/`
/// - a missing leading slash is added
/// - `.` and `..` segments are resolved, redundant slashes collapsed
/// - a trailing slash is preserved on non-root paths
///
/// The function is idempotent: `clean_path(clean_path(p)) == clean_path(p)`.
#[must_use]
pub fn clean_path(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    let trailing_slash = path.len() > 1 && path.ends_with('/');

    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    let mut out = String::with_capacity(path.len());
    out.push('/');
    out.push_str(&segments.join("/"));
    if trailing_slash && out.len() > 1 {
        out.push('/');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_cleaning() {
        assert_eq!(clean_path(""), "/");
        assert_eq!(clean_path("/"), "/");
        assert_eq!(clean_path("echo"), "/echo");
        assert_eq!(clean_path("/a//b"), "/a/b");
        assert_eq!(clean_path("/a/./b"), "/a/b");
        assert_eq!(clean_path("/a/b/../c"), "/a/c");
        assert_eq!(clean_path("/../a"), "/a");
    }

    #[test]
    fn test_trailing_slash_preserved() {
        assert_eq!(clean_path("/a/b/"), "/a/b/");
        assert_eq!(clean_path("/a//b//"), "/a/b/");
        // Root never doubles its slash.
        assert_eq!(clean_path("//"), "/");
        assert_eq!(clean_path("/a/.."), "/");
    }

    #[test]
    fn test_idempotence() {
        for input in [
            "", "/", "echo", "/a//b", "/a/./b/", "/a/b/../c", "//x/../y/", "/trailing/",
        ] {
            let once = clean_path(input);
            assert_eq!(clean_path(&once), once, "not idempotent for {input:?}");
        }
    }
}

//! Extraction of the target URL embedded in an inbound request path
//!
//! Clients request `/<scheme>://<host>/<path>?<query>`; the codec turns that
//! path back into a [`TargetDescriptor`]. Go-style path cleaning in front of
//! the relay may collapse `https://` into `https:/`, so one or two slashes
//! after the scheme are accepted and normalized to two.

use crate::error::{RelayError, Result};
use crate::models::TargetDescriptor;
use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;
use url::Url;

/// Longest inbound path the codec will look at
pub const MAX_PATH_LENGTH: usize = 8 * 1024;

static TARGET_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^/(https?:/?/?)([-a-zA-Z0-9@:%._\+~#=]{1,256}(?:\.[-a-zA-Z0-9()]{1,6})+(?:[-a-zA-Z0-9()@:%_\+.~#?&/=]*))$",
    )
    .expect("target path regex is valid") // Static pattern, safe to panic
});

/// Whether a path is meant for the relay rather than a local route
pub fn is_relay_path(path: &str) -> bool {
    path.starts_with("/http:/") || path.starts_with("/https:/")
}

/// Rebuild the target URL from an inbound path and its raw query string
///
/// The query is appended verbatim, without re-encoding. A query holding
/// bytes the URL parser would percent-encode (`'`, `"`, `<`, `>`) is refused,
/// since it could not reach the origin unchanged.
///
/// # Errors
/// `MalformedTarget` when the path is too long, does not follow the
/// `/<scheme>:/{1,2}<host>...` grammar, does not parse as a URL, or carries
/// a query that cannot be forwarded byte for byte.
pub fn extract_target(path: &str, raw_query: Option<&str>) -> Result<TargetDescriptor> {
    if path.len() > MAX_PATH_LENGTH {
        return Err(RelayError::MalformedTarget(format!(
            "path exceeds {} bytes",
            MAX_PATH_LENGTH
        )));
    }

    let captures = TARGET_PATH.captures(path).ok_or_else(|| {
        RelayError::MalformedTarget(format!("cannot extract target URL from path: {}", path))
    })?;

    let scheme = if captures[1].starts_with("https") {
        "https://"
    } else {
        "http://"
    };
    let rest = &captures[2];

    let query = raw_query.filter(|q| !q.is_empty());
    let mut target = String::with_capacity(
        scheme.len() + rest.len() + query.map_or(0, |q| q.len() + 1),
    );
    target.push_str(scheme);
    target.push_str(rest);
    if let Some(query) = query {
        target.push('?');
        target.push_str(query);
    }

    let url = Url::parse(&target)
        .map_err(|e| RelayError::MalformedTarget(format!("{}: {}", target, e)))?;

    if url.query() != query {
        return Err(RelayError::MalformedTarget(format!(
            "query cannot be forwarded verbatim: {}",
            query.unwrap_or_default()
        )));
    }

    debug!("Extracted target URL: {}", url);
    Ok(TargetDescriptor::with_raw(
        url,
        target,
        query.map(str::to_string),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_with_double_slash() {
        let target = extract_target("/https://example.com/file.zip", None).unwrap();
        assert_eq!(target.as_str(), "https://example.com/file.zip");
    }

    #[test]
    fn test_extract_normalizes_single_slash() {
        let target = extract_target("/http:/example.com/dir/file.zip", None).unwrap();
        assert_eq!(target.scheme(), "http");
        assert_eq!(target.host(), "example.com");
        assert_eq!(target.path(), "/dir/file.zip");
    }

    #[test]
    fn test_extract_keeps_raw_query() {
        let target =
            extract_target("/https://example.com/file.zip", Some("token=abc&sig=a%2Fb")).unwrap();
        assert_eq!(target.query(), Some("token=abc&sig=a%2Fb"));
        assert_eq!(target.as_str(), "https://example.com/file.zip?token=abc&sig=a%2Fb");
    }

    #[test]
    fn test_sub_delims_in_query_are_kept() {
        let query = "sig=a!b*c(d)$e,f;g&x=%2F";
        let target = extract_target("/https://example.com/f.bin", Some(query)).unwrap();
        assert_eq!(target.query(), Some(query));
        assert_eq!(target.url().query(), Some(query));
        assert_eq!(
            target.as_str(),
            "https://example.com/f.bin?sig=a!b*c(d)$e,f;g&x=%2F"
        );
    }

    #[test]
    fn test_rejects_query_the_parser_would_rewrite() {
        // `'` would leave as `%27`
        let err = extract_target("/https://raw.githubusercontent.com/o/r", Some("sig=a'b"))
            .unwrap_err();
        assert!(matches!(err, RelayError::MalformedTarget(_)));
        assert!(err.to_string().contains("verbatim"));

        assert!(extract_target("/https://example.com/a", Some("q=\"x\"")).is_err());
    }

    #[test]
    fn test_raw_text_keeps_client_spelling() {
        let target = extract_target("/https:/Example.COM/a", Some("k=V")).unwrap();
        assert_eq!(target.raw(), "https://Example.COM/a?k=V");
        assert_eq!(target.host(), "example.com");
    }

    #[test]
    fn test_empty_query_is_ignored() {
        let target = extract_target("/https://example.com/a", Some("")).unwrap();
        assert_eq!(target.query(), None);
    }

    #[test]
    fn test_extract_with_port() {
        let target = extract_target("/http://example.com:8080/a", None).unwrap();
        assert_eq!(target.port(), Some(8080));
    }

    #[test]
    fn test_rejects_unsupported_scheme() {
        let err = extract_target("/ftp://example.com/x", None).unwrap_err();
        assert!(matches!(err, RelayError::MalformedTarget(_)));
    }

    #[test]
    fn test_rejects_host_without_dot() {
        assert!(extract_target("/https://localhost/x", None).is_err());
    }

    #[test]
    fn test_rejects_forbidden_characters() {
        assert!(extract_target("/https://example.com/a b", None).is_err());
        assert!(extract_target("/https://exa<mple.com/", None).is_err());
    }

    #[test]
    fn test_rejects_overlong_path() {
        let path = format!("/https://example.com/{}", "a".repeat(MAX_PATH_LENGTH));
        let err = extract_target(&path, None).unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn test_is_relay_path() {
        assert!(is_relay_path("/https://example.com"));
        assert!(is_relay_path("/http:/example.com"));
        assert!(!is_relay_path("/health"));
        assert!(!is_relay_path("/ftp://example.com"));
        assert!(!is_relay_path("/"));
    }
}

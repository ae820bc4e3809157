//! Acceptability checks for extracted targets

use crate::error::{RelayError, Result};
use crate::models::TargetDescriptor;
use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

static WELL_FORMED_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^https?://[-a-zA-Z0-9@:%._\+~#=]{1,256}\.[a-zA-Z0-9()]{1,6}\b(?:[-a-zA-Z0-9()@:%_\+.~#?&/=]*)$",
    )
    .expect("well-formed URL regex is valid") // Static pattern, safe to panic
});

/// Validates targets produced by the URL codec
///
/// Hosts under one of the trusted domains skip the format check entirely;
/// their signed download links routinely carry query strings the generic
/// grammar would refuse.
#[derive(Debug, Clone)]
pub struct UrlValidator {
    trusted_domains: Vec<String>,
}

impl UrlValidator {
    pub fn new(trusted_domains: Vec<String>) -> Self {
        let trusted_domains = trusted_domains
            .into_iter()
            .map(|d| d.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        UrlValidator { trusted_domains }
    }

    /// Whether `host` equals or is a subdomain of a trusted domain
    pub fn is_trusted(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.trusted_domains.iter().any(|domain| {
            host == *domain
                || host
                    .strip_suffix(domain.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }

    /// The format check runs on the target text as the client wrote it, so
    /// characters outside the grammar cannot slip through in encoded form.
    ///
    /// # Errors
    /// `InvalidTarget` for an unsupported scheme, an empty host, or a URL
    /// that does not match the well-formed URL grammar.
    pub fn validate(&self, target: &TargetDescriptor) -> Result<()> {
        if self.is_trusted(target.host()) {
            debug!("Trusted host, skipping format check: {}", target.host());
            return Ok(());
        }

        if target.scheme() != "http" && target.scheme() != "https" {
            return Err(RelayError::InvalidTarget(format!(
                "unsupported scheme: {}",
                target.scheme()
            )));
        }

        if target.host().is_empty() {
            return Err(RelayError::InvalidTarget("host must not be empty".to_string()));
        }

        if !WELL_FORMED_URL.is_match(target.raw()) {
            return Err(RelayError::InvalidTarget(format!(
                "malformed URL: {}",
                target.raw()
            )));
        }

        Ok(())
    }
}

impl Default for UrlValidator {
    fn default() -> Self {
        Self::new(vec!["github.com".to_string(), "githubusercontent.com".to_string()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::url_codec::extract_target;
    use url::Url;

    fn target(s: &str) -> TargetDescriptor {
        TargetDescriptor::new(Url::parse(s).unwrap())
    }

    #[test]
    fn test_accepts_plain_download_url() {
        let validator = UrlValidator::default();
        assert!(validator
            .validate(&target("https://example.com/file.zip?token=abc"))
            .is_ok());
        assert!(validator.validate(&target("http://example.com")).is_ok());
        assert!(validator.validate(&target("http://example.com:8080/a/b")).is_ok());
    }

    #[test]
    fn test_rejects_unsupported_scheme() {
        let err = UrlValidator::default()
            .validate(&target("ftp://example.com/x"))
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidTarget(_)));
        assert!(err.to_string().contains("unsupported scheme"));
    }

    #[test]
    fn test_rejects_query_outside_grammar() {
        // `|` survives URL parsing but is not part of the accepted grammar
        let validator = UrlValidator::default();
        assert!(validator
            .validate(&target("https://example.com/a?x=1|2"))
            .is_err());
    }

    #[test]
    fn test_format_check_sees_raw_query() {
        let validator = UrlValidator::default();
        let target = extract_target("/https://example.com/a", Some("x=1;y=2")).unwrap();
        assert!(validator.validate(&target).is_err());

        let target = extract_target("/https://example.com/a", Some("x=(1)&y=%3B")).unwrap();
        assert!(validator.validate(&target).is_ok());

        let target =
            extract_target("/https://objects.githubusercontent.com/a", Some("x=1;y=2")).unwrap();
        assert!(validator.validate(&target).is_ok());
        assert_eq!(target.query(), Some("x=1;y=2"));
    }

    #[test]
    fn test_trusted_domain_bypass() {
        let validator = UrlValidator::default();
        assert!(validator.is_trusted("github.com"));
        assert!(validator.is_trusted("objects.githubusercontent.com"));
        assert!(!validator.is_trusted("evilgithub.com"));
        assert!(validator
            .validate(&target("https://raw.githubusercontent.com/o/r/main/f?x=1|2"))
            .is_ok());
    }

    #[test]
    fn test_custom_trusted_domains_are_normalized() {
        let validator = UrlValidator::new(vec![" .Example.ORG ".to_string(), String::new()]);
        assert!(validator.is_trusted("cdn.example.org"));
        assert!(!validator.is_trusted("github.com"));
    }
}

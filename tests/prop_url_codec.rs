// Property: targets written in the embedded-path form are recovered intact,
// whichever slash form the scheme arrives in, and validation judges the raw
// query text.

use proptest::prelude::*;
use stream_relay::url_codec::{extract_target, MAX_PATH_LENGTH};
use stream_relay::UrlValidator;

fn host_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9]{0,9}(\\.[a-z][a-z0-9]{0,9}){0,2}\\.(com|org|net|io)"
}

fn path_strategy() -> impl Strategy<Value = String> {
    "([a-zA-Z0-9_-]{1,10}/){0,3}[a-zA-Z0-9_-]{1,10}(\\.(zip|tar|gz|bin))?"
}

fn query_strategy() -> impl Strategy<Value = Option<String>> {
    proptest::option::of("[a-z]{1,5}=[a-z0-9!*()$,;%]{0,8}(&[a-z]{1,5}=[a-z0-9!*()$,;%]{0,8}){0,2}")
}

/// Characters of the well-formed URL grammar allowed after the host
fn within_grammar(query: &str) -> bool {
    query
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-()@:%_+.~#?&/=".contains(c))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Scheme, host, path and raw query survive extraction unchanged, and
    /// the URL handed to the outbound client carries the same query bytes
    #[test]
    fn prop_extract_preserves_target(
        https in any::<bool>(),
        host in host_strategy(),
        path in path_strategy(),
        query in query_strategy(),
    ) {
        let scheme = if https { "https" } else { "http" };
        let inbound = format!("/{}://{}/{}", scheme, host, path);

        let target = extract_target(&inbound, query.as_deref()).unwrap();
        prop_assert_eq!(target.scheme(), scheme);
        prop_assert_eq!(target.host(), host.as_str());
        let expected_path = format!("/{}", path);
        prop_assert_eq!(target.path(), expected_path.as_str());
        prop_assert_eq!(target.query(), query.as_deref());
        prop_assert_eq!(target.url().query(), query.as_deref());

        let expected = match &query {
            Some(q) => format!("{}://{}/{}?{}", scheme, host, path, q),
            None => format!("{}://{}/{}", scheme, host, path),
        };
        prop_assert_eq!(target.as_str(), expected.as_str());

        let validator = UrlValidator::default();
        let accepted = validator.validate(&target).is_ok();
        let expected_accept =
            validator.is_trusted(&host) || query.as_deref().map_or(true, within_grammar);
        prop_assert_eq!(accepted, expected_accept);
    }

    /// A query the URL parser would rewrite is refused rather than altered
    #[test]
    fn prop_rewritten_query_is_refused(
        host in host_strategy(),
        head in "[a-z]{1,5}=[a-z0-9]{0,4}",
        special in "['\"<>]",
        tail in "[a-z0-9]{0,4}",
    ) {
        let query = format!("{}{}{}", head, special, tail);
        let inbound = format!("/https://{}/file.bin", host);
        prop_assert!(extract_target(&inbound, Some(&query)).is_err());
    }

    /// A collapsed `scheme:/host` path yields the same URL as `scheme://host`
    #[test]
    fn prop_single_slash_is_normalized(
        host in host_strategy(),
        path in path_strategy(),
    ) {
        let double = extract_target(&format!("/https://{}/{}", host, path), None).unwrap();
        let single = extract_target(&format!("/https:/{}/{}", host, path), None).unwrap();
        prop_assert_eq!(double.as_str(), single.as_str());
    }

    /// Paths over the length limit are refused before parsing
    #[test]
    fn prop_overlong_paths_rejected(extra in 1usize..512) {
        let prefix = "/https://example.com/";
        let inbound = format!("{}{}", prefix, "a".repeat(MAX_PATH_LENGTH - prefix.len() + extra));
        prop_assert!(extract_target(&inbound, None).is_err());
    }

    /// Arbitrary input never panics the codec
    #[test]
    fn prop_extract_never_panics(path in "\\PC{0,200}", query in proptest::option::of("\\PC{0,50}")) {
        let _ = extract_target(&path, query.as_deref());
    }

    /// Trust covers the domain and its subdomains, never look-alike suffixes
    #[test]
    fn prop_trusted_suffix_matching(label in "[a-z0-9]{1,12}") {
        let validator = UrlValidator::default();
        prop_assert!(validator.is_trusted("github.com"));
        let subdomain = format!("{}.github.com", label);
        let look_alike = format!("{}github.com", label);
        prop_assert!(validator.is_trusted(&subdomain));
        prop_assert!(!validator.is_trusted(&look_alike));
    }
}

//! Header rewriting in both directions
//!
//! Outbound, the inbound request headers are filtered into the header set sent
//! to the target, with `Via` and `X-Forwarded-For` rebuilt. Inbound, the
//! origin's response headers are filtered and the relay's security and
//! diagnostic headers are forced on top. Download responses additionally get
//! `Content-Type`, `Content-Disposition` and cache-busting headers.

use crate::config::HeadersConfig;
use crate::error::{RelayError, Result};
use crate::models::TargetDescriptor;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::Version;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

/// Credential headers never relayed in either direction
pub const SENSITIVE_HEADERS: [HeaderName; 3] =
    [header::AUTHORIZATION, header::COOKIE, header::SET_COOKIE];

/// Connection-management headers owned by each connection leg
const HOP_BY_HOP_HEADERS: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
];

const X_PROCESSING_TIME: &str = "x-processing-time";
const X_PROXY_NODE: &str = "x-proxy-node";
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Header rewriting rules for one relay instance
#[derive(Debug, Clone)]
pub struct HeaderPolicy {
    remove_proxy_headers: bool,
    remove_sensitive_headers: bool,
    node_id: HeaderValue,
    proxy_identifier: String,
}

impl HeaderPolicy {
    /// # Errors
    /// `ConfigError` when the node id or proxy identifier is not a valid
    /// header value.
    pub fn from_config(config: &HeadersConfig) -> Result<Self> {
        let node_id = HeaderValue::from_str(&config.node_id).map_err(|e| {
            RelayError::ConfigError(format!("node_id is not a valid header value: {}", e))
        })?;
        HeaderValue::from_str(&config.proxy_identifier).map_err(|e| {
            RelayError::ConfigError(format!(
                "proxy_identifier is not a valid header value: {}",
                e
            ))
        })?;

        Ok(HeaderPolicy {
            remove_proxy_headers: config.remove_proxy_headers,
            remove_sensitive_headers: config.remove_sensitive_headers,
            node_id,
            proxy_identifier: config.proxy_identifier.clone(),
        })
    }

    /// Headers to send to the target, derived from the client's request
    ///
    /// # Arguments
    /// * `inbound` - Headers of the client request
    /// * `version` - HTTP version of the client request, used for a fresh `Via`
    /// * `peer_ip` - Address of the connection the request arrived on
    pub fn outbound(&self, inbound: &HeaderMap, version: Version, peer_ip: IpAddr) -> HeaderMap {
        let connection_listed = connection_tokens(inbound);
        let mut outbound = HeaderMap::with_capacity(inbound.len() + 2);

        for (name, value) in inbound {
            if self.skip_outbound(name, &connection_listed) {
                continue;
            }
            outbound.append(name.clone(), value.clone());
        }

        let via = match joined(inbound, &header::VIA) {
            Some(prior) => format!("{}, {}", prior, self.proxy_identifier),
            None => format!("{:?} {}", version, self.proxy_identifier),
        };
        if let Ok(value) = HeaderValue::from_str(&via) {
            outbound.insert(header::VIA, value);
        }

        let forwarded_for = match joined(inbound, X_FORWARDED_FOR) {
            Some(prior) => format!("{}, {}", prior, peer_ip),
            None => peer_ip.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            outbound.insert(X_FORWARDED_FOR, value);
        }

        debug!("Outbound headers: {} of {} kept", outbound.len(), inbound.len());
        outbound
    }

    fn skip_outbound(&self, name: &HeaderName, connection_listed: &[String]) -> bool {
        let lower = name.as_str();
        if is_hop_by_hop(lower) || connection_listed.iter().any(|t| t == lower) {
            return true;
        }
        // Rebuilt below, or set by the outbound client for the target
        if name == header::HOST
            || name == header::CONTENT_LENGTH
            || name == header::VIA
            || lower == X_FORWARDED_FOR
        {
            return true;
        }
        // Credentials meant for this relay never reach the target
        if name == header::PROXY_AUTHORIZATION {
            return true;
        }
        if self.remove_proxy_headers && lower.starts_with("proxy-") {
            return true;
        }
        self.remove_sensitive_headers && SENSITIVE_HEADERS.contains(name)
    }

    /// Headers to return to the client, derived from the origin response
    pub fn inbound(&self, origin: &HeaderMap, elapsed: Duration) -> HeaderMap {
        let connection_listed = connection_tokens(origin);
        let mut headers = HeaderMap::with_capacity(origin.len() + 7);

        for (name, value) in origin {
            let lower = name.as_str();
            if is_hop_by_hop(lower) || connection_listed.iter().any(|t| t == lower) {
                continue;
            }
            if name == header::PROXY_AUTHENTICATE {
                continue;
            }
            if self.remove_sensitive_headers && SENSITIVE_HEADERS.contains(name) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        headers.insert(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        );
        headers.insert(
            header::X_XSS_PROTECTION,
            HeaderValue::from_static("1; mode=block"),
        );
        headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
        headers.insert(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        );
        headers.insert(
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static("default-src 'self'"),
        );

        if let Ok(value) = HeaderValue::from_str(&format!("{:.6}s", elapsed.as_secs_f64())) {
            headers.insert(X_PROCESSING_TIME, value);
        }
        headers.insert(X_PROXY_NODE, self.node_id.clone());

        headers
    }

    /// Add the download-oriented headers to a response header set
    ///
    /// `Content-Type` and `Content-Disposition` from the origin win when
    /// present; otherwise they are derived from the target URL. The
    /// cache-busting triad is always set.
    pub fn apply_download_headers(&self, headers: &mut HeaderMap, target: &TargetDescriptor) {
        let file_name = derive_filename(target);

        if !headers.contains_key(header::CONTENT_TYPE) {
            let inferred = infer_content_type(target.path());
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(inferred));
        }

        if !headers.contains_key(header::CONTENT_DISPOSITION) && !file_name.is_empty() {
            if let Some(value) = attachment_disposition(&file_name) {
                headers.insert(header::CONTENT_DISPOSITION, value);
            }
        }

        headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache, no-store, must-revalidate"),
        );
        headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
        headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    }
}

impl Default for HeaderPolicy {
    fn default() -> Self {
        let config = HeadersConfig::default();
        HeaderPolicy {
            remove_proxy_headers: config.remove_proxy_headers,
            remove_sensitive_headers: config.remove_sensitive_headers,
            node_id: HeaderValue::from_static("node1"),
            proxy_identifier: config.proxy_identifier,
        }
    }
}

/// Display name of the file a target points at
///
/// Priority: the `filename` query parameter, the filename embedded in a
/// `response-content-disposition` query parameter, then the last path
/// segment. Empty when none of them yields a name.
pub fn derive_filename(target: &TargetDescriptor) -> String {
    let mut from_disposition = None;
    for (key, value) in target.url().query_pairs() {
        match key.as_ref() {
            "filename" if !value.is_empty() => return value.into_owned(),
            "response-content-disposition" if from_disposition.is_none() => {
                from_disposition = filename_from_disposition(&value);
            }
            _ => {}
        }
    }
    if let Some(name) = from_disposition {
        return name;
    }

    let segment = target.path().rsplit('/').next().unwrap_or("");
    urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}

fn filename_from_disposition(disposition: &str) -> Option<String> {
    let (_, rest) = disposition.split_once("filename=")?;
    let name = rest
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .trim_matches(|c| c == '"' || c == '\'');
    (!name.is_empty()).then(|| name.to_string())
}

/// Content type for a download without one, by file extension
pub fn infer_content_type(path: &str) -> &'static str {
    let file = path.rsplit('/').next().unwrap_or("");
    let ext = file
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "zip" => "application/zip",
        "pdf" => "application/pdf",
        "exe" => "application/octet-stream",
        _ => "application/octet-stream",
    }
}

fn attachment_disposition(file_name: &str) -> Option<HeaderValue> {
    let plain = file_name
        .chars()
        .all(|c| c.is_ascii_graphic() && !matches!(c, '"' | '\\' | ';'));

    let value = if plain {
        format!("attachment; filename={}", file_name)
    } else {
        format!(
            "attachment; filename*=UTF-8''{}",
            urlencoding::encode(file_name)
        )
    };
    HeaderValue::from_str(&value).ok()
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name)
}

/// Header names listed in `Connection`, lowercased
fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// All values of a header joined with `, `, skipping non-ASCII values
fn joined<K: header::AsHeaderName>(headers: &HeaderMap, name: K) -> Option<String> {
    let values: Vec<&str> = headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    (!values.is_empty()).then(|| values.join(", "))
}

//! Data models shared across the relay

use std::fmt;
use url::{Host, Url};

/// Destination embedded in an inbound request path
///
/// Built once per request by the URL codec and never mutated afterwards.
/// The parsed URL drives host, port and path decisions; `raw` keeps the
/// target text exactly as the client sent it, query included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDescriptor {
    url: Url,
    raw: String,
    raw_query: Option<String>,
}

impl TargetDescriptor {
    /// Wrap an already parsed URL, taking its serialization as the raw text
    pub fn new(url: Url) -> Self {
        let raw = url.as_str().to_string();
        let raw_query = url.query().map(str::to_string);
        TargetDescriptor {
            url,
            raw,
            raw_query,
        }
    }

    /// Pair a parsed URL with the text it was parsed from
    pub fn with_raw(url: Url, raw: String, raw_query: Option<String>) -> Self {
        TargetDescriptor {
            url,
            raw,
            raw_query,
        }
    }

    /// URL scheme, `http` or `https` for anything the codec produces
    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// Host as written in the URL (IPv6 literals keep their brackets)
    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or("")
    }

    /// Parsed host, distinguishing domains from IP literals
    pub fn parsed_host(&self) -> Option<Host<&str>> {
        self.url.host()
    }

    /// Explicit port, if one was given
    pub fn port(&self) -> Option<u16> {
        self.url.port()
    }

    /// Explicit port or the scheme default
    pub fn port_or_default(&self) -> u16 {
        self.url.port_or_known_default().unwrap_or(80)
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// Raw query string, exactly as forwarded by the client
    pub fn query(&self) -> Option<&str> {
        self.raw_query.as_deref()
    }

    /// Fully-qualified target URL in its normalized form
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    /// Target text as the client wrote it, before URL normalization
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

/// Human-readable size with two decimals, `unknown size` when absent
pub fn format_size(size: Option<u64>) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    const TB: u64 = 1024 * GB;

    let Some(size) = size else {
        return "unknown size".to_string();
    };

    match size {
        s if s >= TB => format!("{:.2} TB", s as f64 / TB as f64),
        s if s >= GB => format!("{:.2} GB", s as f64 / GB as f64),
        s if s >= MB => format!("{:.2} MB", s as f64 / MB as f64),
        s if s >= KB => format!("{:.2} KB", s as f64 / KB as f64),
        s => format!("{} B", s),
    }
}

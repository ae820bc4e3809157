//! SSRF protection: classify targets that land in private address space
//!
//! Literal IP hosts are classified directly. Hostnames are resolved and the
//! target counts as private when any resolved address does. A failed lookup
//! is decided by [`DnsFailurePolicy`]; the default `Allow` keeps unresolvable
//! names proxyable (the outbound connect will then fail on its own).

use crate::config::DnsFailurePolicy;
use crate::models::TargetDescriptor;
use async_trait::async_trait;
use regex::Regex;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, warn};
use url::Host;

static RFC1918_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(127\.|10\.|172\.(1[6-9]|2[0-9]|3[0-1])\.|192\.168\.)")
        .expect("RFC1918 regex is valid") // Static pattern, safe to panic
});

/// Resolves hostnames to addresses
///
/// Abstracted so tests can pin resolution results without touching DNS.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the system's `getaddrinfo`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, port)).await?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

/// Private-address classifier for relay targets
pub struct SsrfGuard {
    resolver: Arc<dyn HostResolver>,
    dns_failure_policy: DnsFailurePolicy,
    lookup_timeout: Duration,
}

impl SsrfGuard {
    /// Guard using the system resolver
    pub fn new(dns_failure_policy: DnsFailurePolicy, lookup_timeout: Duration) -> Self {
        Self::with_resolver(Arc::new(SystemResolver), dns_failure_policy, lookup_timeout)
    }

    pub fn with_resolver(
        resolver: Arc<dyn HostResolver>,
        dns_failure_policy: DnsFailurePolicy,
        lookup_timeout: Duration,
    ) -> Self {
        SsrfGuard {
            resolver,
            dns_failure_policy,
            lookup_timeout,
        }
    }

    /// Whether the target points into loopback or private address space
    ///
    /// Never fails: resolution errors and timeouts are mapped through the
    /// configured [`DnsFailurePolicy`].
    pub async fn is_private(&self, target: &TargetDescriptor) -> bool {
        let domain = match target.parsed_host() {
            Some(Host::Ipv4(ip)) => return is_private_ip(IpAddr::V4(ip)),
            Some(Host::Ipv6(ip)) => return is_private_ip(IpAddr::V6(ip)),
            Some(Host::Domain(domain)) => domain,
            None => return false,
        };

        let lookup = self.resolver.resolve(domain, target.port_or_default());
        let addrs = match tokio::time::timeout(self.lookup_timeout, lookup).await {
            Ok(Ok(addrs)) => addrs,
            Ok(Err(e)) => return self.on_dns_failure(domain, &e.to_string()),
            Err(_) => return self.on_dns_failure(domain, "lookup timed out"),
        };

        let private = addrs
            .iter()
            .any(|addr| is_private_ip(*addr) || RFC1918_TEXT.is_match(&addr.to_string()));

        debug!(
            "Resolved {} to {:?} (private: {})",
            domain, addrs, private
        );
        private
    }

    fn on_dns_failure(&self, domain: &str, reason: &str) -> bool {
        match self.dns_failure_policy {
            DnsFailurePolicy::Allow => {
                debug!("DNS lookup for {} failed ({}), treating as public", domain, reason);
                false
            }
            DnsFailurePolicy::Deny => {
                warn!("DNS lookup for {} failed ({}), treating as private", domain, reason);
                true
            }
        }
    }
}

/// Loopback, RFC 1918, RFC 4193, link-local or unspecified
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_private_v4(v4),
            None => is_private_v6(v6),
        },
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified()
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link-local
        || (first & 0xffc0) == 0xfe80
}

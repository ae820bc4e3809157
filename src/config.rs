//! Configuration management for the relay
//!
//! Configuration is read once at startup from a YAML file. Every field has a
//! default, so a partial file (or no file at all) yields a working setup.

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Top-level relay configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub headers: HeadersConfig,

    #[serde(default)]
    pub tracker: TrackerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics endpoint configuration (optional)
    #[serde(default)]
    pub metrics_endpoint: Option<MetricsEndpointConfig>,
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Seconds to wait for in-flight connections on shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Seconds a client gets to send a complete request head (default: 5)
    #[serde(default = "default_header_read_timeout")]
    pub header_read_timeout_secs: u64,

    /// Seconds a connection may pass without any traffic before it is
    /// closed (default: 60)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

/// Outbound transfer settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyConfig {
    /// Connect and TLS handshake timeout in seconds (default: 5)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Extra seconds the origin gets to send response headers once the
    /// connect budget is spent (default: 5)
    #[serde(default = "default_response_header_timeout")]
    pub response_header_timeout_secs: u64,

    /// Whole-transfer timeout in seconds (default: 300)
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_secs: u64,

    /// Size of each pooled copy buffer in bytes (default: 32KB)
    /// Valid range: 4KB to 4MB
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Number of idle buffers the pool keeps around (default: 256)
    #[serde(default = "default_max_pooled_buffers")]
    pub max_pooled_buffers: usize,

    /// Accept any certificate presented by a target (default: true)
    #[serde(default = "default_true")]
    pub accept_invalid_certs: bool,
}

/// What the SSRF guard concludes when a hostname cannot be resolved
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DnsFailurePolicy {
    /// Treat the target as public and let the transfer fail on its own
    #[default]
    Allow,
    /// Treat the target as private and reject it
    Deny,
}

/// Admission and address policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecurityConfig {
    #[serde(default)]
    pub rate_limiting: RateLimitConfig,

    /// Reject targets resolving into private address space (default: true)
    #[serde(default = "default_true")]
    pub private_ip_blocking: bool,

    #[serde(default)]
    pub dns_failure_policy: DnsFailurePolicy,

    /// Host suffixes accepted without the well-formed URL check
    #[serde(default = "default_trusted_domains")]
    pub trusted_domains: Vec<String>,
}

/// Per-client sliding window settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Requests admitted per client per rolling minute (default: 60)
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: usize,

    /// Interval of the idle-window sweep in seconds (default: 300)
    #[serde(default = "default_idle_sweep")]
    pub idle_sweep_secs: u64,
}

/// Header rewriting settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeadersConfig {
    /// Strip `Proxy-*` request headers (default: true)
    #[serde(default = "default_true")]
    pub remove_proxy_headers: bool,

    /// Strip credential headers in both directions (default: true)
    #[serde(default = "default_true")]
    pub remove_sensitive_headers: bool,

    /// Value of the `X-Proxy-Node` response header
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Identifier appended to the `Via` request header
    #[serde(default = "default_proxy_identifier")]
    pub proxy_identifier: String,
}

/// Download tracker settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackerConfig {
    /// Sweep interval in seconds (default: 600)
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// How long a finished record is kept in seconds (default: 1800)
    #[serde(default = "default_retention")]
    pub retention_secs: u64,

    /// Minimum gap between progress lines in seconds (default: 10)
    #[serde(default = "default_progress_interval")]
    pub progress_log_interval_secs: u64,
}

/// Output format of the log subscriber
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset (default: "info")
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

/// Configuration for the metrics HTTP endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsEndpointConfig {
    /// Whether to enable the metrics endpoint (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Address to bind the metrics endpoint to (default: "127.0.0.1:9090")
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_grace_secs: default_shutdown_grace(),
            header_read_timeout_secs: default_header_read_timeout(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            response_header_timeout_secs: default_response_header_timeout(),
            transfer_timeout_secs: default_transfer_timeout(),
            buffer_size: default_buffer_size(),
            max_pooled_buffers: default_max_pooled_buffers(),
            accept_invalid_certs: default_true(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            rate_limiting: RateLimitConfig::default(),
            private_ip_blocking: default_true(),
            dns_failure_policy: DnsFailurePolicy::default(),
            trusted_domains: default_trusted_domains(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            requests_per_minute: default_requests_per_minute(),
            idle_sweep_secs: default_idle_sweep(),
        }
    }
}

impl Default for HeadersConfig {
    fn default() -> Self {
        Self {
            remove_proxy_headers: default_true(),
            remove_sensitive_headers: default_true(),
            node_id: default_node_id(),
            proxy_identifier: default_proxy_identifier(),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: default_cleanup_interval(),
            retention_secs: default_retention(),
            progress_log_interval_secs: default_progress_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl Default for MetricsEndpointConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

// Default value functions for serde
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_header_read_timeout() -> u64 {
    5
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_response_header_timeout() -> u64 {
    5
}

fn default_transfer_timeout() -> u64 {
    300
}

fn default_buffer_size() -> usize {
    32 * 1024 // 32KB
}

fn default_max_pooled_buffers() -> usize {
    256
}

fn default_true() -> bool {
    true
}

fn default_trusted_domains() -> Vec<String> {
    vec!["github.com".to_string(), "githubusercontent.com".to_string()]
}

fn default_requests_per_minute() -> usize {
    60
}

fn default_idle_sweep() -> u64 {
    300
}

fn default_node_id() -> String {
    "node1".to_string()
}

fn default_proxy_identifier() -> String {
    "StreamRelay".to_string()
}

fn default_cleanup_interval() -> u64 {
    600 // 10 minutes
}

fn default_retention() -> u64 {
    1800 // 30 minutes
}

fn default_progress_interval() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_address() -> String {
    "127.0.0.1:9090".to_string()
}

impl ServerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn header_read_timeout(&self) -> Duration {
        Duration::from_secs(self.header_read_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl ProxyConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Bound on the wait for response headers, connect included
    pub fn response_header_deadline(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs + self.response_header_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }
}

impl TrackerConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn progress_log_interval(&self) -> Duration {
        Duration::from_secs(self.progress_log_interval_secs)
    }
}

impl RelayConfig {
    /// Load configuration from a YAML file
    ///
    /// # Returns
    /// * `Ok(RelayConfig)` if loading and validation succeed
    /// * `Err(RelayError)` if file cannot be read or config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            RelayError::ConfigError(format!("Failed to read config file: {}", e))
        })?;

        let config: RelayConfig = serde_yaml::from_str(&content).map_err(|e| {
            RelayError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration, writing the defaults to `path` first if it does not exist
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::from_file(path);
        }

        let config = RelayConfig::default();
        config.save_to_file(path)?;
        info!("Wrote default configuration to {}", path.display());
        Ok(config)
    }

    /// Serialize this configuration to a YAML file, creating parent directories
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                RelayError::ConfigError(format!("Failed to create config directory: {}", e))
            })?;
        }

        let yaml = serde_yaml::to_string(self).map_err(|e| {
            RelayError::ConfigError(format!("Failed to serialize config: {}", e))
        })?;

        fs::write(path, yaml).map_err(|e| {
            RelayError::ConfigError(format!("Failed to write config file: {}", e))
        })
    }

    /// Address the relay listens on
    pub fn listen_address(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .map_err(|e| {
                RelayError::ConfigError(format!(
                    "Invalid listen address {}:{}: {}",
                    self.server.host, self.server.port, e
                ))
            })
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - timeouts must be > 0 and transfer_timeout >= connect_timeout
    /// - server header-read and idle timeouts must be > 0
    /// - buffer_size must be between 4KB and 4MB
    /// - requests_per_minute must be > 0 when rate limiting is enabled
    /// - node_id and proxy_identifier must not be empty
    /// - tracker intervals must be > 0
    /// - the metrics address must parse when the endpoint is enabled
    pub fn validate(&self) -> Result<()> {
        const MIN_BUFFER_SIZE: usize = 4 * 1024; // 4KB
        const MAX_BUFFER_SIZE: usize = 4 * 1024 * 1024; // 4MB

        if self.proxy.connect_timeout_secs == 0
            || self.proxy.transfer_timeout_secs == 0
            || self.proxy.response_header_timeout_secs == 0
        {
            return Err(RelayError::ConfigError(
                "connect_timeout_secs, response_header_timeout_secs and transfer_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.server.header_read_timeout_secs == 0 || self.server.idle_timeout_secs == 0 {
            return Err(RelayError::ConfigError(
                "header_read_timeout_secs and idle_timeout_secs must be greater than 0"
                    .to_string(),
            ));
        }

        if self.proxy.transfer_timeout_secs < self.proxy.connect_timeout_secs {
            return Err(RelayError::ConfigError(format!(
                "transfer_timeout_secs ({}) must not be shorter than connect_timeout_secs ({})",
                self.proxy.transfer_timeout_secs, self.proxy.connect_timeout_secs
            )));
        }

        if self.proxy.buffer_size < MIN_BUFFER_SIZE || self.proxy.buffer_size > MAX_BUFFER_SIZE {
            return Err(RelayError::ConfigError(format!(
                "buffer_size must be between {}KB and {}MB, got {} bytes",
                MIN_BUFFER_SIZE / 1024,
                MAX_BUFFER_SIZE / (1024 * 1024),
                self.proxy.buffer_size
            )));
        }

        let rate = &self.security.rate_limiting;
        if rate.enabled && rate.requests_per_minute == 0 {
            return Err(RelayError::ConfigError(
                "requests_per_minute must be greater than 0 when rate limiting is enabled"
                    .to_string(),
            ));
        }

        if rate.enabled && rate.idle_sweep_secs == 0 {
            return Err(RelayError::ConfigError(
                "idle_sweep_secs must be greater than 0".to_string(),
            ));
        }

        if self.headers.node_id.trim().is_empty() {
            return Err(RelayError::ConfigError("node_id must not be empty".to_string()));
        }

        if self.headers.proxy_identifier.trim().is_empty() {
            return Err(RelayError::ConfigError(
                "proxy_identifier must not be empty".to_string(),
            ));
        }

        if self.tracker.cleanup_interval_secs == 0 || self.tracker.progress_log_interval_secs == 0 {
            return Err(RelayError::ConfigError(
                "tracker intervals must be greater than 0".to_string(),
            ));
        }

        if let Some(endpoint) = self.metrics_endpoint.as_ref().filter(|e| e.enabled) {
            endpoint.address.parse::<SocketAddr>().map_err(|e| {
                RelayError::ConfigError(format!(
                    "Invalid metrics address '{}': {}",
                    endpoint.address, e
                ))
            })?;
        }

        Ok(())
    }
}

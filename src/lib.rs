//! Stream Relay
//!
//! An HTTP download relay that embeds the target URL in the request path.
//! A request for `/https://github.com/owner/repo/archive/main.zip` is checked,
//! forwarded to `https://github.com/owner/repo/archive/main.zip`, and the
//! origin's body is streamed back to the client with cleaned headers and
//! download-friendly metadata.
//!
//! # Request pipeline
//!
//! 1. [`RateLimiter`]: per-client sliding window, 429 on overflow
//! 2. [`url_codec`]: rebuild the target URL from path and raw query
//! 3. [`UrlValidator`]: scheme, host and trusted-domain rules
//! 4. [`SsrfGuard`]: refuse targets resolving to private addresses
//! 5. [`HeaderPolicy`]: outbound and inbound header rewriting
//! 6. [`TransferEngine`]: outbound call and pooled-buffer streaming
//! 7. [`DownloadTracker`]: per-URL progress and terminal classification
//!
//! [`RelayHandler`] runs the pipeline for one request; [`RelayServer`] serves
//! it over HTTP/1.1.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use stream_relay::{RelayConfig, RelayHandler, RelayServer};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RelayConfig::load_or_create("config.yaml")?;
//! let handler = Arc::new(RelayHandler::new(&config)?);
//! handler.start_background_tasks();
//!
//! let addr = config.listen_address()?;
//! let server = RelayServer::bind(addr, handler.clone(), &config.server).await?;
//! server.serve(async { let _ = tokio::signal::ctrl_c().await; }).await?;
//! handler.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from a YAML file; every field has a default:
//!
//! ```yaml
//! server:
//!   host: 0.0.0.0
//!   port: 8080
//! security:
//!   private_ip_blocking: true
//!   trusted_domains: [github.com, githubusercontent.com]
//!   rate_limiting:
//!     enabled: true
//!     requests_per_minute: 60
//! ```
//!
//! See [`RelayConfig`] for every option.

pub mod buffer_pool;
pub mod config;
pub mod error;
pub mod handler;
pub mod headers;
pub mod metrics;
pub mod metrics_endpoint;
pub mod models;
pub mod rate_limiter;
pub mod server;
pub mod ssrf;
pub mod task;
pub mod tracker;
pub mod transfer;
pub mod url_codec;
pub mod validator;

// Re-export commonly used types
pub use buffer_pool::{BufferPool, PooledBuffer};
pub use config::{DnsFailurePolicy, LogFormat, RelayConfig};
pub use error::{RelayError, Result};
pub use handler::RelayHandler;
pub use headers::HeaderPolicy;
pub use metrics::RelayMetrics;
pub use metrics_endpoint::MetricsEndpoint;
pub use models::TargetDescriptor;
pub use rate_limiter::RateLimiter;
pub use server::RelayServer;
pub use ssrf::{HostResolver, SsrfGuard, SystemResolver};
pub use tracker::{DownloadSnapshot, DownloadStatus, DownloadTracker, TransferOutcome};
pub use transfer::{RelayBody, TransferEngine, TransferGuard};
pub use url_codec::extract_target;
pub use validator::UrlValidator;

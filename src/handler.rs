//! Request orchestration
//!
//! Local routes (`/`, `/health`, `/favicon.ico`) are answered directly. Relay
//! paths pass admission, extraction, validation and the SSRF check before the
//! outbound request is made; the origin body is then streamed back through the
//! download tracker.

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::headers::{derive_filename, HeaderPolicy};
use crate::metrics::RelayMetrics;
use crate::models::format_size;
use crate::rate_limiter::{RateLimiter, RETRY_AFTER_SECS};
use crate::ssrf::{HostResolver, SsrfGuard, SystemResolver};
use crate::tracker::DownloadTracker;
use crate::transfer::{RelayBody, TransferEngine, TransferGuard};
use crate::url_codec::{extract_target, is_relay_path};
use crate::validator::UrlValidator;
use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderValue};
use http::request::Parts;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Empty, Full};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const HOME_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Stream Relay</title></head>
<body>
    <h1>Stream Relay</h1>
    <p>Prefix any http or https URL with this host to download it through the relay:</p>
    <pre>/https://example.com/path/to/file.zip</pre>
</body>
</html>"#;

/// The relay's request pipeline
pub struct RelayHandler {
    validator: UrlValidator,
    ssrf: SsrfGuard,
    block_private: bool,
    limiter: Option<Arc<RateLimiter>>,
    headers: HeaderPolicy,
    engine: TransferEngine,
    tracker: Arc<DownloadTracker>,
    metrics: Arc<RelayMetrics>,
    rate_limit_sweep: Duration,
    cleanup_interval: Duration,
}

impl RelayHandler {
    /// Build the pipeline with the system DNS resolver
    pub fn new(config: &RelayConfig) -> Result<Self> {
        Self::with_resolver(config, Arc::new(SystemResolver))
    }

    /// Build the pipeline with a custom resolver for the SSRF check
    pub fn with_resolver(config: &RelayConfig, resolver: Arc<dyn HostResolver>) -> Result<Self> {
        let security = &config.security;

        let limiter = security
            .rate_limiting
            .enabled
            .then(|| Arc::new(RateLimiter::new(security.rate_limiting.requests_per_minute)));

        let metrics = RelayMetrics::new().map_err(|e| {
            RelayError::InternalFailure(format!("Failed to register metrics: {}", e))
        })?;

        Ok(RelayHandler {
            validator: UrlValidator::new(security.trusted_domains.clone()),
            ssrf: SsrfGuard::with_resolver(
                resolver,
                security.dns_failure_policy,
                config.proxy.connect_timeout(),
            ),
            block_private: security.private_ip_blocking,
            limiter,
            headers: HeaderPolicy::from_config(&config.headers)?,
            engine: TransferEngine::new(&config.proxy, security.private_ip_blocking)?,
            tracker: Arc::new(DownloadTracker::new(
                config.tracker.retention(),
                config.tracker.progress_log_interval(),
            )),
            metrics: Arc::new(metrics),
            rate_limit_sweep: Duration::from_secs(security.rate_limiting.idle_sweep_secs),
            cleanup_interval: config.tracker.cleanup_interval(),
        })
    }

    pub fn tracker(&self) -> &Arc<DownloadTracker> {
        &self.tracker
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    /// Start the rate-limit sweep and the download cleanup
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_background_tasks(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.start(self.rate_limit_sweep);
        }
        self.tracker.start(self.cleanup_interval);
    }

    /// Stop the background tasks
    pub async fn shutdown(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.shutdown().await;
        }
        self.tracker.shutdown().await;
    }

    /// Handle one inbound request
    ///
    /// Never fails: every error becomes a response with the matching status.
    pub async fn handle<B>(&self, req: Request<B>, peer: SocketAddr) -> Response<RelayBody> {
        let started = Instant::now();
        // Request bodies are never relayed
        let (parts, body) = req.into_parts();
        drop(body);

        let client_ip = client_ip(&parts.headers, peer);
        let path = parts.uri.path().to_string();

        if !is_relay_path(&path) {
            let (response, size) = local_route(&path);
            info!(
                client_ip = %client_ip,
                method = %parts.method,
                path = %path,
                status = response.status().as_u16(),
                size = %format_size(Some(size)),
                duration = ?started.elapsed(),
                "Request served"
            );
            return response;
        }

        match self.relay(&parts, peer, &client_ip, started).await {
            Ok(response) => {
                self.metrics.record_request("proxied");
                response
            }
            Err(e) => {
                self.metrics.record_request(e.outcome_label());
                warn!(
                    client_ip = %client_ip,
                    path = %path,
                    status = e.to_http_status(),
                    "Relay request rejected: {}",
                    e
                );
                error_response(&e)
            }
        }
    }

    async fn relay(
        &self,
        req: &Parts,
        peer: SocketAddr,
        client_ip: &str,
        started: Instant,
    ) -> Result<Response<RelayBody>> {
        // Keyed on the socket peer, not on spoofable forwarding headers
        if let Some(limiter) = &self.limiter {
            let key = peer.ip().to_string();
            if !limiter.admit(&key) {
                return Err(RelayError::RateLimited(key));
            }
        }

        let target = extract_target(req.uri.path(), req.uri.query())?;
        self.validator.validate(&target)?;

        if self.block_private && self.ssrf.is_private(&target).await {
            return Err(RelayError::PrivateAddress(target.host().to_string()));
        }

        let outbound = self.headers.outbound(&req.headers, req.version, peer.ip());
        let sent = Instant::now();
        let origin = self
            .engine
            .execute(req.method.clone(), &target, outbound)
            .await?;
        self.metrics.record_upstream_latency(sent.elapsed());

        let status = origin.status();
        let mut headers = self.headers.inbound(origin.headers(), started.elapsed());
        self.headers.apply_download_headers(&mut headers, &target);

        // No body follows: nothing to stream or track
        if req.method == Method::HEAD
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            let body = Empty::<Bytes>::new()
                .map_err(|never| match never {})
                .boxed_unsync();
            return Ok(build_response(status, headers, body));
        }

        let total_size = content_length(origin.headers());
        let file_name = derive_filename(&target);
        let record = self
            .tracker
            .get_or_create(target.as_str(), &file_name, total_size, client_ip);
        let guard = TransferGuard::new(self.tracker.clone(), record, self.metrics.clone());
        let body = self.engine.stream_body(origin, guard);

        Ok(build_response(status, headers, body))
    }
}

/// Client address for logs: forwarding headers first, then the socket peer
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = real_ip {
        return ip.to_string();
    }

    peer.ip().to_string()
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn local_route(path: &str) -> (Response<RelayBody>, u64) {
    match path {
        "/health" => text_response(StatusCode::OK, "text/plain; charset=utf-8", "OK"),
        "/" => text_response(StatusCode::OK, "text/html; charset=utf-8", HOME_PAGE),
        "/favicon.ico" => text_response(
            StatusCode::NOT_FOUND,
            "text/plain; charset=utf-8",
            "404 page not found",
        ),
        _ => text_response(
            StatusCode::BAD_REQUEST,
            "text/plain; charset=utf-8",
            "invalid request path",
        ),
    }
}

fn text_response(
    status: StatusCode,
    content_type: &'static str,
    body: &'static str,
) -> (Response<RelayBody>, u64) {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    let size = body.len() as u64;
    (build_response(status, headers, full_body(Bytes::from_static(body.as_bytes()))), size)
}

/// Response for a rejected or failed relay request
pub fn error_response(err: &RelayError) -> Response<RelayBody> {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    if matches!(err, RelayError::RateLimited(_)) {
        headers.insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
    }

    build_response(err.status_code(), headers, full_body(Bytes::from(err.to_string())))
}

fn full_body(bytes: Bytes) -> RelayBody {
    Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
}

fn build_response(status: StatusCode, headers: HeaderMap, body: RelayBody) -> Response<RelayBody> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

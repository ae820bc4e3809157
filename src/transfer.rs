//! Outbound execution and body streaming
//!
//! The engine sends the rewritten request to the target and turns the origin
//! body into a response body for hyper. Every chunk is copied through a pooled
//! buffer and reported to the download tracker. A [`TransferGuard`] travels
//! with the body and reports the terminal outcome exactly once, including
//! when hyper drops the body because the client went away.

use crate::buffer_pool::{BufferPool, PooledBuffer};
use crate::config::ProxyConfig;
use crate::error::{RelayError, Result};
use crate::metrics::RelayMetrics;
use crate::models::TargetDescriptor;
use crate::ssrf::is_private_ip;
use crate::tracker::{DownloadRecord, DownloadTracker, TransferOutcome};
use bytes::Bytes;
use futures_util::{stream, TryStreamExt};
use http::{HeaderMap, Method};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};
use url::Host;

/// Error type carried by relay response bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Response body type produced by the relay
pub type RelayBody = UnsyncBoxBody<Bytes, BoxError>;

const MAX_REDIRECTS: usize = 10;

/// Reports a transfer's progress and its terminal outcome
///
/// Dropping the guard before [`TransferGuard::finish`] counts as a client
/// disconnect.
pub struct TransferGuard {
    tracker: Arc<DownloadTracker>,
    record: Arc<DownloadRecord>,
    metrics: Arc<RelayMetrics>,
    finished: bool,
}

impl TransferGuard {
    pub fn new(
        tracker: Arc<DownloadTracker>,
        record: Arc<DownloadRecord>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        metrics.active_transfers.inc();
        TransferGuard {
            tracker,
            record,
            metrics,
            finished: false,
        }
    }

    /// Account bytes handed to the client connection
    pub fn record(&self, bytes: u64) {
        self.record.update_progress(bytes);
        self.metrics.record_bytes(bytes);
    }

    /// Report the terminal outcome; later calls are ignored
    pub fn finish(&mut self, outcome: TransferOutcome) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.metrics.active_transfers.dec();

        if let Some(status) = self.tracker.connection_closed(&self.record, &outcome) {
            self.metrics.record_download(status.as_str());
        }
    }
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        if !self.finished {
            debug!("Body dropped before the end: {}", self.record.url());
            self.finish(TransferOutcome::ClientDisconnected);
        }
    }
}

struct BodyState {
    reader: Pin<Box<dyn AsyncRead + Send>>,
    buffer: PooledBuffer,
    guard: TransferGuard,
    done: bool,
}

/// Executes outbound requests and streams their bodies
pub struct TransferEngine {
    client: reqwest::Client,
    pool: BufferPool,
    header_timeout: Duration,
}

impl TransferEngine {
    /// Build the outbound client from the proxy settings
    ///
    /// # Arguments
    /// * `config` - Timeouts, buffer sizing and TLS leniency
    /// * `block_private_redirects` - Refuse redirects to private IP literals
    pub fn new(config: &ProxyConfig, block_private_redirects: bool) -> Result<Self> {
        let redirect = reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                return attempt.error("too many redirects");
            }
            if block_private_redirects && redirects_to_private(attempt.url()) {
                warn!("Refusing redirect to private address: {}", attempt.url());
                return attempt.stop();
            }
            attempt.follow()
        });

        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.transfer_timeout())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .redirect(redirect)
            .tcp_nodelay(true)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(32)
            .build()
            .map_err(|e| {
                RelayError::ConfigError(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(TransferEngine {
            client,
            pool: BufferPool::new(config.buffer_size, config.max_pooled_buffers),
            header_timeout: config.response_header_deadline(),
        })
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Send the outbound request and wait for the response headers
    ///
    /// Connect and TLS handshake are bounded by the connect timeout. The wait
    /// for headers gets the response-header budget on top of that, and the
    /// whole transfer, body included, is bounded by the transfer timeout.
    ///
    /// The codec only admits targets whose parsed query equals the raw one,
    /// so the URL sent here carries the client's query bytes unchanged.
    ///
    /// # Errors
    /// `Timeout` when the headers do not arrive in time, `UpstreamFailure`
    /// for any other failure of the outbound call.
    pub async fn execute(
        &self,
        method: Method,
        target: &TargetDescriptor,
        headers: HeaderMap,
    ) -> Result<reqwest::Response> {
        let started = Instant::now();
        let request = self
            .client
            .request(method, target.url().clone())
            .headers(headers)
            .send();

        let response = tokio::time::timeout(self.header_timeout, request)
            .await
            .map_err(|_| {
                RelayError::Timeout(format!(
                    "no response headers from {} within {:?}",
                    target.host(),
                    self.header_timeout
                ))
            })??;

        debug!(
            "Upstream {} answered {} in {:?}",
            target,
            response.status(),
            started.elapsed()
        );
        Ok(response)
    }

    /// Turn an origin response body into a relay body
    pub fn stream_body(&self, response: reqwest::Response, guard: TransferGuard) -> RelayBody {
        let reader = StreamReader::new(response.bytes_stream().map_err(std::io::Error::other));

        let state = BodyState {
            reader: Box::pin(reader),
            buffer: self.pool.acquire(),
            guard,
            done: false,
        };

        let frames = stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }

            match state.reader.read(state.buffer.as_mut_slice()).await {
                Ok(0) => {
                    state.done = true;
                    state.guard.finish(TransferOutcome::Completed);
                    None
                }
                Ok(n) => {
                    let chunk = Bytes::copy_from_slice(&state.buffer[..n]);
                    state.guard.record(n as u64);
                    Some((Ok(Frame::data(chunk)), state))
                }
                Err(e) => {
                    state.done = true;
                    state.guard.finish(TransferOutcome::Failed(e.to_string()));
                    let err: BoxError = Box::new(e);
                    Some((Err(err), state))
                }
            }
        });

        StreamBody::new(frames).boxed_unsync()
    }
}

/// Whether a redirect location is a private IP literal
fn redirects_to_private(url: &url::Url) -> bool {
    match url.host() {
        Some(Host::Ipv4(ip)) => is_private_ip(ip.into()),
        Some(Host::Ipv6(ip)) => is_private_ip(ip.into()),
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        None => false,
    }
}

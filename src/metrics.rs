//! Prometheus metrics for the relay
//!
//! Each [`RelayMetrics`] owns its own [`Registry`], so several relays (or
//! tests) in one process never collide on metric names.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Metrics for relayed requests and downloads
#[derive(Clone)]
pub struct RelayMetrics {
    registry: Registry,

    /// Relay requests by outcome label
    pub requests_total: IntCounterVec,

    /// Body bytes written to clients
    pub bytes_relayed_total: IntCounter,

    /// Transfers currently streaming
    pub active_transfers: IntGauge,

    /// Download records by terminal classification
    pub downloads_total: IntCounterVec,

    /// Time from sending the outbound request to receiving its headers
    pub upstream_latency_seconds: Histogram,
}

impl RelayMetrics {
    /// Create metrics registered in a fresh registry
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new())
    }

    /// Create metrics registered in `registry`
    pub fn with_registry(registry: Registry) -> Result<Self, prometheus::Error> {
        let requests_total = IntCounterVec::new(
            Opts::new(
                "stream_relay_requests_total",
                "Total number of relay requests by outcome",
            ),
            &["outcome"], // proxied, malformed, invalid, private, rate_limited, ...
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let bytes_relayed_total = IntCounter::new(
            "stream_relay_bytes_relayed_total",
            "Total body bytes written to clients",
        )?;
        registry.register(Box::new(bytes_relayed_total.clone()))?;

        let active_transfers = IntGauge::new(
            "stream_relay_active_transfers",
            "Number of transfers currently streaming",
        )?;
        registry.register(Box::new(active_transfers.clone()))?;

        let downloads_total = IntCounterVec::new(
            Opts::new(
                "stream_relay_downloads_total",
                "Total number of finished downloads by status",
            ),
            &["status"], // completed, cancelled, errored
        )?;
        registry.register(Box::new(downloads_total.clone()))?;

        let upstream_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "stream_relay_upstream_latency_seconds",
                "Time to receive response headers from the target in seconds",
            )
            .buckets(vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
        )?;
        registry.register(Box::new(upstream_latency_seconds.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            bytes_relayed_total,
            active_transfers,
            downloads_total,
            upstream_latency_seconds,
        })
    }

    /// Record one relay request outcome
    pub fn record_request(&self, outcome: &str) {
        self.requests_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_bytes(&self, bytes: u64) {
        self.bytes_relayed_total.inc_by(bytes);
    }

    pub fn record_download(&self, status: &str) {
        self.downloads_total.with_label_values(&[status]).inc();
    }

    pub fn record_upstream_latency(&self, elapsed: Duration) {
        self.upstream_latency_seconds.observe(elapsed.as_secs_f64());
    }

    /// Current count for one request outcome
    pub fn requests(&self, outcome: &str) -> u64 {
        self.requests_total.with_label_values(&[outcome]).get()
    }

    /// Render every metric in the Prometheus text exposition format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

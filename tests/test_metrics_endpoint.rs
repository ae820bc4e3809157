//! Integration tests for the metrics endpoint
//!
//! These tests verify that the metrics HTTP endpoint exposes the relay's
//! metrics in Prometheus format.

use std::sync::Arc;
use std::time::Duration;
use stream_relay::{MetricsEndpoint, RelayMetrics};
use tokio::sync::oneshot;

async fn start_endpoint(metrics: Arc<RelayMetrics>) -> (String, oneshot::Sender<()>) {
    let endpoint = MetricsEndpoint::bind(metrics, "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let base = format!("http://{}", endpoint.local_addr().unwrap());

    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(endpoint.serve(async {
        let _ = rx.await;
    }));
    (base, tx)
}

#[tokio::test]
async fn test_metrics_endpoint_serves_metrics() {
    let metrics = Arc::new(RelayMetrics::new().unwrap());
    metrics.record_request("proxied");
    metrics.record_request("proxied");
    metrics.record_request("private");
    metrics.record_bytes(1000);
    metrics.record_download("completed");
    metrics.record_upstream_latency(Duration::from_millis(40));

    let (base, _shutdown) = start_endpoint(Arc::clone(&metrics)).await;

    let response = reqwest::get(format!("{}/metrics", base)).await.unwrap();
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();

    assert!(body.contains("stream_relay_requests_total{outcome=\"proxied\"} 2"));
    assert!(body.contains("stream_relay_requests_total{outcome=\"private\"} 1"));
    assert!(body.contains("stream_relay_bytes_relayed_total 1000"));
    assert!(body.contains("stream_relay_downloads_total{status=\"completed\"} 1"));
    assert!(body.contains("stream_relay_upstream_latency_seconds_bucket"));
}

#[tokio::test]
async fn test_metrics_endpoint_reflects_updates() {
    let metrics = Arc::new(RelayMetrics::new().unwrap());
    let (base, _shutdown) = start_endpoint(Arc::clone(&metrics)).await;

    let before = reqwest::get(format!("{}/metrics", base))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(!before.contains("outcome=\"rate_limited\""));

    metrics.record_request("rate_limited");

    let after = reqwest::get(format!("{}/metrics", base))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(after.contains("stream_relay_requests_total{outcome=\"rate_limited\"} 1"));
}

#[tokio::test]
async fn test_metrics_endpoint_health_and_404() {
    let metrics = Arc::new(RelayMetrics::new().unwrap());
    let (base, _shutdown) = start_endpoint(metrics).await;

    let health = reqwest::get(format!("{}/health", base)).await.unwrap();
    assert_eq!(health.status(), 200);
    assert_eq!(health.text().await.unwrap(), "OK");

    let missing = reqwest::get(format!("{}/unknown", base)).await.unwrap();
    assert_eq!(missing.status(), 404);
}

#[tokio::test]
async fn test_metrics_endpoint_shuts_down() {
    let metrics = Arc::new(RelayMetrics::new().unwrap());
    let endpoint = MetricsEndpoint::bind(metrics, "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    let (tx, rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(endpoint.serve(async {
        let _ = rx.await;
    }));

    tx.send(()).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
    assert!(matches!(result, Ok(Ok(Ok(())))));
}

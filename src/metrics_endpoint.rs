//! Metrics HTTP Endpoint
//!
//! Serves the relay's Prometheus metrics on a separate listener, so the
//! scrape port can stay private while the relay port is public.

use crate::metrics::RelayMetrics;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Metrics endpoint server
pub struct MetricsEndpoint {
    metrics: Arc<RelayMetrics>,
    listener: TcpListener,
}

impl MetricsEndpoint {
    /// Bind the metrics listener
    ///
    /// # Arguments
    /// * `metrics` - Shared metrics collector
    /// * `addr` - Address to bind the HTTP server to
    pub async fn bind(metrics: Arc<RelayMetrics>, addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { metrics, listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve `/metrics` and `/health` until `shutdown` resolves
    pub async fn serve<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = self.listener.local_addr()?;
        info!("Metrics endpoint listening on http://{}", addr);
        info!("Metrics available at http://{}/metrics", addr);

        tokio::pin!(shutdown);
        loop {
            let (stream, _) = tokio::select! {
                accepted = self.listener.accept() => accepted?,
                _ = &mut shutdown => {
                    info!("Metrics endpoint shutting down");
                    return Ok(());
                }
            };
            let io = TokioIo::new(stream);
            let metrics = Arc::clone(&self.metrics);

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let metrics = Arc::clone(&metrics);
                    async move { handle_request(req, metrics).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving metrics connection: {:?}", err);
                }
            });
        }
    }
}

/// Handle incoming HTTP requests
async fn handle_request<B>(
    req: Request<B>,
    metrics: Arc<RelayMetrics>,
) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    match req.uri().path() {
        "/metrics" => metrics_response(&metrics),
        "/health" => plain_response(StatusCode::OK, "text/plain", "OK"),
        _ => plain_response(StatusCode::NOT_FOUND, "text/plain", "404 Not Found"),
    }
}

/// Render the registry in Prometheus text format
fn metrics_response(metrics: &RelayMetrics) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    match metrics.encode() {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
            .body(Full::new(Bytes::from(body))),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            plain_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                "failed to encode metrics",
            )
        }
    }
}

fn plain_response(
    status: StatusCode,
    content_type: &'static str,
    body: &'static str,
) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .body(Full::new(Bytes::from_static(body.as_bytes())))
}

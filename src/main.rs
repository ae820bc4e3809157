//! Stream Relay Server
//!
//! Loads configuration, sets up logging, and serves the relay until Ctrl-C.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use stream_relay::{LogFormat, MetricsEndpoint, RelayConfig, RelayHandler, RelayServer};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// HTTP download relay with the target URL embedded in the path
#[derive(Parser, Debug)]
#[command(name = "stream-relay", version, about)]
struct Args {
    /// Path to the YAML configuration; created with defaults when missing
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = RelayConfig::load_or_create(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    init_logging(&config);

    info!("Starting Stream Relay");
    info!("Configuration loaded from {}", args.config.display());
    info!("  - Trusted domains: {:?}", config.security.trusted_domains);
    info!("  - Private IP blocking: {}", config.security.private_ip_blocking);
    info!(
        "  - Rate limiting: {} ({} requests/minute)",
        config.security.rate_limiting.enabled, config.security.rate_limiting.requests_per_minute
    );
    info!(
        "  - Timeouts: connect {}s, response headers +{}s, transfer {}s",
        config.proxy.connect_timeout_secs,
        config.proxy.response_header_timeout_secs,
        config.proxy.transfer_timeout_secs
    );
    info!(
        "  - Client timeouts: request head {}s, idle {}s",
        config.server.header_read_timeout_secs, config.server.idle_timeout_secs
    );
    info!("  - Buffer size: {} KB", config.proxy.buffer_size / 1024);

    let handler = Arc::new(RelayHandler::new(&config).context("Failed to build relay")?);
    handler.start_background_tasks();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if let Some(endpoint) = config.metrics_endpoint.as_ref().filter(|m| m.enabled) {
        let addr: SocketAddr = endpoint
            .address
            .parse()
            .with_context(|| format!("Invalid metrics address {}", endpoint.address))?;
        let metrics = MetricsEndpoint::bind(handler.metrics().clone(), addr)
            .await
            .with_context(|| format!("Failed to bind metrics endpoint on {}", addr))?;

        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let shutdown = async move {
                let _ = rx.wait_for(|stop| *stop).await;
            };
            if let Err(e) = metrics.serve(shutdown).await {
                error!("Metrics endpoint failed: {}", e);
            }
        });
    }

    let addr = config.listen_address()?;
    let server = RelayServer::bind(addr, handler.clone(), &config.server)
        .await
        .with_context(|| format!("Failed to bind relay on {}", addr))?;

    let shutdown = async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C, shutting down"),
            Err(e) => {
                error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        }
        let _ = shutdown_tx.send(true);
    };

    server.serve(shutdown).await?;
    handler.shutdown().await;

    info!("Stream Relay stopped");
    Ok(())
}

fn init_logging(config: &RelayConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

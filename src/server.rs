//! Relay HTTP server
//!
//! Accepts client connections, hands every request to the [`RelayHandler`]
//! and drains open connections on shutdown. A client must finish each
//! request head within the header-read timeout, and a connection that sees
//! no traffic for the idle timeout is closed.

use crate::config::ServerConfig;
use crate::error::RelayError;
use crate::handler::{error_response, RelayHandler};
use crate::tracker::is_client_disconnect;
use crate::transfer::RelayBody;
use futures_util::FutureExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::server::graceful::GracefulShutdown;
use std::any::Any;
use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Pause after a failed accept, e.g. when the process is out of descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// The public relay listener
pub struct RelayServer {
    handler: Arc<RelayHandler>,
    listener: TcpListener,
    grace: Duration,
    header_read_timeout: Duration,
    idle_timeout: Duration,
}

impl RelayServer {
    /// Bind the relay listener
    ///
    /// # Arguments
    /// * `addr` - Address to accept clients on
    /// * `handler` - Shared request pipeline
    /// * `config` - Shutdown grace and client-side timeouts
    pub async fn bind(
        addr: SocketAddr,
        handler: Arc<RelayHandler>,
        config: &ServerConfig,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            handler,
            listener,
            grace: config.shutdown_grace(),
            header_read_timeout: config.header_read_timeout(),
            idle_timeout: config.idle_timeout(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve clients until `shutdown` resolves, then drain open connections
    pub async fn serve<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = self.listener.local_addr()?;
        info!("Relay listening on http://{}", addr);

        let graceful = GracefulShutdown::new();
        tokio::pin!(shutdown);

        loop {
            let (stream, peer) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
                _ = &mut shutdown => break,
            };

            let handler = Arc::clone(&self.handler);
            let service = service_fn(move |req: Request<Incoming>| {
                let handler = Arc::clone(&handler);
                async move { Ok::<_, Infallible>(dispatch(&handler, req, peer).await) }
            });

            let activity = Activity::new();
            let io = TokioIo::new(ActivityStream::new(stream, activity.clone()));
            let conn = http1::Builder::new()
                .timer(TokioTimer::new())
                .header_read_timeout(self.header_read_timeout)
                .keep_alive(true)
                .serve_connection(io, service);
            let conn = graceful.watch(conn);
            let idle_timeout = self.idle_timeout;

            tokio::task::spawn(async move {
                tokio::select! {
                    result = conn => {
                        if let Err(err) = result {
                            let message = err.to_string();
                            if is_client_disconnect(&message)
                                || err.is_incomplete_message()
                                || err.is_timeout()
                            {
                                debug!(peer = %peer, "Client connection closed: {}", message);
                            } else {
                                warn!(peer = %peer, "Error serving connection: {:?}", err);
                            }
                        }
                    }
                    _ = activity.idle_for(idle_timeout) => {
                        debug!(peer = %peer, "Closing connection idle for {:?}", idle_timeout);
                    }
                }
            });
        }

        drop(self.listener);
        info!("Relay stopped accepting, draining open connections");

        tokio::select! {
            _ = graceful.shutdown() => info!("All connections closed"),
            _ = tokio::time::sleep(self.grace) => {
                warn!("Shutdown grace of {:?} elapsed with connections still open", self.grace);
            }
        }
        Ok(())
    }
}

/// Time of the last byte moved on a connection, in either direction
#[derive(Clone)]
struct Activity {
    started: Instant,
    last_ms: Arc<AtomicU64>,
}

impl Activity {
    fn new() -> Self {
        Activity {
            started: Instant::now(),
            last_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_ms.store(now, Ordering::Relaxed);
    }

    fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    /// Resolves once nothing has moved for `limit`
    async fn idle_for(&self, limit: Duration) {
        loop {
            let idle = self.idle();
            if idle >= limit {
                return;
            }
            tokio::time::sleep(limit - idle).await;
        }
    }
}

/// Client stream that stamps [`Activity`] on every read and write
struct ActivityStream<S> {
    inner: S,
    activity: Activity,
}

impl<S> ActivityStream<S> {
    fn new(inner: S, activity: Activity) -> Self {
        ActivityStream { inner, activity }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ActivityStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if matches!(poll, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            self.activity.touch();
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ActivityStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if matches!(poll, Poll::Ready(Ok(n)) if n > 0) {
            self.activity.touch();
        }
        poll
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write_vectored(cx, bufs);
        if matches!(poll, Poll::Ready(Ok(n)) if n > 0) {
            self.activity.touch();
        }
        poll
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Run the handler, turning a panic into a 500 response
async fn dispatch(
    handler: &RelayHandler,
    req: Request<Incoming>,
    peer: SocketAddr,
) -> Response<RelayBody> {
    match AssertUnwindSafe(handler.handle(req, peer)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            let err = RelayError::InternalFailure("request handler failed".to_string());
            error!(peer = %peer, "Request handler panicked: {}", panic_message(&*panic));
            handler.metrics().record_request(err.outcome_label());
            error_response(&err)
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

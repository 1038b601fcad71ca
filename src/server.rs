//! Listening socket, connection handling and lifecycle.
//!
//! The server moves through `Starting → Listening → Draining → Stopped`.
//! Each accepted connection is served on its own task; a shutdown signal
//! stops the accept loop, lets in-flight requests finish for the grace
//! period, then force-closes whatever is left.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{ProxyError, Result};
use crate::proxy::Gateway;

/// Lifecycle state of the proxy server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Starting,
    Listening,
    Draining,
    Stopped,
}

/// Listener and lifecycle settings.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen: SocketAddr,
    pub bind_attempts: u32,
    pub bind_backoff: Duration,
    pub grace_period: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 3000)),
            bind_attempts: 3,
            bind_backoff: Duration::from_secs(2),
            grace_period: Duration::from_secs(5),
        }
    }
}

/// Binds `addr`, retrying on failure.
///
/// Makes up to `attempts` tries with `backoff` between them, logging each
/// failure, and gives up with [`ProxyError::BindFailure`].
pub async fn bind_with_retry(
    addr: SocketAddr,
    attempts: u32,
    backoff: Duration,
) -> Result<TcpListener> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) if attempt < attempts => {
                tracing::error!(
                    address = %addr,
                    attempt,
                    attempts,
                    error = %e,
                    "failed to bind listener, retrying"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(source) => {
                tracing::error!(address = %addr, attempts, error = %source, "giving up on bind");
                return Err(ProxyError::BindFailure {
                    addr,
                    attempts,
                    source,
                });
            }
        }
    }
}

/// The forwarding proxy server.
pub struct ProxyServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    gateway: Arc<Gateway>,
    grace_period: Duration,
    state: watch::Sender<ServerState>,
}

impl ProxyServer {
    /// Binds the listening socket.
    ///
    /// The server stays in `Starting` until [`ProxyServer::run`] is called.
    pub async fn bind(options: &ServerOptions, gateway: Arc<Gateway>) -> Result<Self> {
        let (state, _) = watch::channel(ServerState::Starting);
        let listener =
            bind_with_retry(options.listen, options.bind_attempts, options.bind_backoff).await?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ProxyError::Io("failed to read local address", e))?;

        Ok(Self {
            listener,
            local_addr,
            gateway,
            grace_period: options.grace_period,
            state,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Subscribes to lifecycle state changes.
    pub fn state(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Accepts connections until `shutdown` is cancelled, then drains.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Self {
            listener,
            local_addr,
            gateway,
            grace_period,
            state,
        } = self;

        let connections = TaskTracker::new();
        let force_close = CancellationToken::new();

        state.send_replace(ServerState::Listening);
        tracing::info!(address = %local_addr, "proxy listening");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::error!(error = %e, "failed to accept connection");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };
                    connections.spawn(serve_connection(
                        stream,
                        remote,
                        gateway.clone(),
                        shutdown.clone(),
                        force_close.clone(),
                    ));
                }
            }
        }

        drop(listener);
        state.send_replace(ServerState::Draining);
        connections.close();
        tracing::info!(
            in_flight = connections.len(),
            grace_ms = grace_period.as_millis() as u64,
            "shutdown requested, draining connections"
        );

        if tokio::time::timeout(grace_period, connections.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = connections.len(),
                "grace period elapsed, force-closing connections"
            );
            force_close.cancel();
            connections.wait().await;
        }

        state.send_replace(ServerState::Stopped);
        tracing::info!("proxy stopped");
        Ok(())
    }
}

/// Serves one client connection until it closes, drains or is force-closed.
async fn serve_connection(
    stream: TcpStream,
    remote: SocketAddr,
    gateway: Arc<Gateway>,
    shutdown: CancellationToken,
    force_close: CancellationToken,
) {
    let _ = stream.set_nodelay(true);
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let gateway = gateway.clone();
        async move { Ok::<_, Infallible>(gateway.handle(req).await) }
    });

    let conn = http1::Builder::new()
        .timer(TokioTimer::new())
        .serve_connection(io, service);
    tokio::pin!(conn);

    let result = tokio::select! {
        res = conn.as_mut() => res,
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            tokio::select! {
                res = conn.as_mut() => res,
                _ = force_close.cancelled() => {
                    tracing::debug!(remote = %remote, "connection force-closed");
                    return;
                }
            }
        }
    };

    if let Err(e) = result {
        tracing::debug!(remote = %remote, error = %e, "connection error");
    }
}

//! HTTP admin server for liveness and readiness probes.
//!
//! Provides `/healthz` (liveness), `/readyz` (readiness) and `/upstreams`
//! (tracked upstream health) so orchestrators can poll the proxy instead
//! of sleeping a fixed delay before starting dependents.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::proxy::{full_body, json_response, HealthTracker, ProxyBody};
use crate::server::ServerState;

/// State read by the admin endpoints.
#[derive(Clone)]
pub struct AdminState {
    pub server_state: watch::Receiver<ServerState>,
    pub health_tracker: Arc<HealthTracker>,
}

/// Handles admin requests.
///
/// Returns 200 "ok" for `/healthz`, 200/503 for `/readyz` depending on
/// whether the proxy is accepting traffic, the upstream health list for
/// `/upstreams`, and 404 for all other paths.
pub async fn health_handler<B>(
    req: Request<B>,
    admin: AdminState,
) -> Result<Response<ProxyBody>, Infallible> {
    let response = match req.uri().path() {
        "/healthz" => text(StatusCode::OK, "ok"),
        "/readyz" => {
            let state = *admin.server_state.borrow();
            let status = if state == ServerState::Listening {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            json_response(status, &serde_json::json!({ "state": state }))
        }
        "/upstreams" => json_response(
            StatusCode::OK,
            &serde_json::json!({ "upstreams": admin.health_tracker.all() }),
        ),
        _ => text(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

fn text(status: StatusCode, body: &'static str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response
}

/// Starts the admin server on the given address.
///
/// Accepts connections until `shutdown` is cancelled.
pub async fn start_health_server(
    addr: SocketAddr,
    admin: AdminState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(address = %addr, "admin server listening");

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };
        let io = TokioIo::new(stream);
        let admin = admin.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| health_handler(req, admin.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(error = %e, "admin connection error");
            }
        });
    }

    tracing::debug!("admin server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener as StdTcpListener;
    use std::time::Duration;

    use crate::proxy::Target;
    use crate::test_util::raw_get;

    /// Starts an admin server reporting `state` on a free local port.
    async fn start(state: ServerState) -> (SocketAddr, Arc<HealthTracker>, CancellationToken) {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (_tx, rx) = watch::channel(state);
        let tracker = Arc::new(HealthTracker::default());
        let admin = AdminState {
            server_state: rx,
            health_tracker: tracker.clone(),
        };
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move {
            let _ = start_health_server(addr, admin, token).await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        (addr, tracker, shutdown)
    }

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        let (addr, _, shutdown) = start(ServerState::Starting).await;
        let (status, body) = raw_get(addr, "/healthz").await;
        assert_eq!(status, 200);
        assert_eq!(body, "ok");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_readyz_ok_while_listening() {
        let (addr, _, shutdown) = start(ServerState::Listening).await;
        let response = raw_get(addr, "/readyz").await;
        assert_eq!(response.0, 200);
        assert!(response.1.contains("listening"));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_readyz_unavailable_while_draining() {
        let (addr, _, shutdown) = start(ServerState::Draining).await;
        let response = raw_get(addr, "/readyz").await;
        assert_eq!(response.0, 503);
        assert!(response.1.contains("draining"));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_upstreams_lists_tracked_targets() {
        let (addr, tracker, shutdown) = start(ServerState::Listening).await;
        let target = Target::new("127.0.0.1", 5000);
        for _ in 0..3 {
            tracker.record_failure(&target);
        }
        let response = raw_get(addr, "/upstreams").await;
        assert_eq!(response.0, 200);
        let json: serde_json::Value = serde_json::from_str(&response.1).unwrap();
        assert_eq!(json["upstreams"][0]["target"], "127.0.0.1:5000");
        assert_eq!(json["upstreams"][0]["status"], "unhealthy");
        assert_eq!(json["upstreams"][0]["consecutive_failures"], 3);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unknown_path_returns_404() {
        let (addr, _, shutdown) = start(ServerState::Listening).await;
        let response = raw_get(addr, "/foo").await;
        assert_eq!(response.0, 404);
        shutdown.cancel();
    }
}

//! Per-request pipeline for the proxy.
//!
//! Wires Router → HealthTracker → Forwarder → relay for each request and
//! turns every failure into an HTTP response. A request handled here can
//! never bring the server down.

use std::sync::Arc;
use std::time::Instant;

use hyper::body::Body;
use hyper::{Request, Response};

use super::forwarder::{BoxError, Forwarder};
use super::relay::{error_response, relay, ProxyBody};
use super::router::Router;
use super::upstream::HealthTracker;
use crate::error::ProxyError;

/// Routes requests to upstream targets and relays their responses.
///
/// Shared by every connection. The router is read-only; the health
/// tracker is the only mutable shared state.
pub struct Gateway {
    router: Router,
    forwarder: Forwarder,
    health_tracker: Arc<HealthTracker>,
    health_checks: bool,
}

impl Gateway {
    /// Creates a new Gateway.
    ///
    /// With `health_checks` off, targets are always tried regardless of
    /// their tracked health.
    pub fn new(
        router: Router,
        forwarder: Forwarder,
        health_tracker: Arc<HealthTracker>,
        health_checks: bool,
    ) -> Self {
        Self {
            router,
            forwarder,
            health_tracker,
            health_checks,
        }
    }

    /// Handles one request end to end.
    pub async fn handle<B>(&self, request: Request<B>) -> Response<ProxyBody>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        let started = Instant::now();
        let method = request.method().clone();
        let path = request.uri().path().to_string();

        let (response, upstream) = match self.proxy(request).await {
            Ok((response, upstream)) => (response, upstream),
            Err((err, upstream)) => {
                if err.is_operational() {
                    tracing::warn!(method = %method, path = %path, error = %err, "proxy error");
                } else {
                    tracing::debug!(method = %method, path = %path, error = %err, "request rejected");
                }
                (error_response(&err), upstream)
            }
        };

        tracing::info!(
            method = %method,
            path = %path,
            status = response.status().as_u16(),
            upstream = upstream.as_deref().unwrap_or("-"),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request completed"
        );
        response
    }

    /// Resolves, health-gates and forwards a request.
    ///
    /// Returns the upstream authority alongside the outcome for logging.
    async fn proxy<B>(
        &self,
        request: Request<B>,
    ) -> Result<(Response<ProxyBody>, Option<String>), (ProxyError, Option<String>)>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        let path = request.uri().path();
        let route = self
            .router
            .resolve(path)
            .ok_or_else(|| (ProxyError::RouteNotFound(path.to_string()), None))?;
        let upstream = route.target.authority();

        if self.health_checks && !self.health_tracker.is_healthy(&route.target) {
            return Err((
                ProxyError::UpstreamUnhealthy(upstream.clone()),
                Some(upstream),
            ));
        }

        let pending = self
            .forwarder
            .forward(route, request)
            .await
            .map_err(|e| (e, Some(upstream.clone())))?;

        self.health_tracker.record_success(&route.target);
        let (response, _transferred) = relay(pending);
        Ok((response, Some(upstream)))
    }
}

//! Periodic upstream health probing and startup readiness polling.

use std::sync::Arc;
use std::time::Duration;

use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::header::HOST;
use hyper::{Method, Request};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::forwarder;
use super::router::Target;
use super::upstream::HealthTracker;
use crate::error::ProxyError;

/// Probe settings shared by every target.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub method: Method,
    pub path: String,
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            method: Method::HEAD,
            path: "/".to_string(),
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(2),
        }
    }
}

/// Result of a single probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Unhealthy { reason: String },
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Issues lightweight health requests against upstream targets.
#[derive(Debug, Clone)]
pub struct Prober {
    config: ProbeConfig,
    tracker: Arc<HealthTracker>,
}

impl Prober {
    pub fn new(config: ProbeConfig, tracker: Arc<HealthTracker>) -> Self {
        Self { config, tracker }
    }

    /// Probes a target once.
    ///
    /// Any response below 500 counts as healthy: the process is up and
    /// answering. The whole probe is bounded by the probe timeout.
    pub async fn probe(&self, target: &Target) -> ProbeOutcome {
        let attempt = async {
            let stream = forwarder::connect(target, self.config.timeout).await?;
            let request = Request::builder()
                .method(self.config.method.clone())
                .uri(self.config.path.as_str())
                .header(HOST, target.authority())
                .body(Empty::<Bytes>::new())
                .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;
            let (response, _guard) = forwarder::send(target, stream, request).await?;
            Ok::<_, ProxyError>(response.status())
        };

        match tokio::time::timeout(self.config.timeout, attempt).await {
            Ok(Ok(status)) if status.is_server_error() => ProbeOutcome::Unhealthy {
                reason: format!("status {status}"),
            },
            Ok(Ok(_)) => ProbeOutcome::Healthy,
            Ok(Err(e)) => ProbeOutcome::Unhealthy {
                reason: e.to_string(),
            },
            Err(_) => ProbeOutcome::Unhealthy {
                reason: format!("no response within {:?}", self.config.timeout),
            },
        }
    }

    /// Probes a target and records the outcome.
    pub async fn check(&self, target: &Target) -> ProbeOutcome {
        let outcome = self.probe(target).await;
        match &outcome {
            ProbeOutcome::Healthy => self.tracker.record_success(target),
            ProbeOutcome::Unhealthy { reason } => {
                tracing::debug!(upstream = %target, reason = %reason, "health probe failed");
                self.tracker.record_failure(target);
            }
        }
        outcome
    }

    /// Spawns one probing task per target.
    ///
    /// Each task probes immediately, then on every interval tick, until
    /// `shutdown` is cancelled.
    pub fn spawn(&self, targets: Vec<Target>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        targets
            .into_iter()
            .map(|target| {
                let prober = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(prober.config.interval);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = ticker.tick() => {
                                prober.check(&target).await;
                            }
                        }
                    }
                    tracing::debug!(upstream = %target, "health prober stopped");
                })
            })
            .collect()
    }

    /// Polls a target until it answers, up to `attempts` times.
    ///
    /// Returns `true` as soon as a probe succeeds.
    pub async fn wait_until_ready(&self, target: &Target, attempts: u32, delay: Duration) -> bool {
        for attempt in 1..=attempts {
            match self.check(target).await {
                ProbeOutcome::Healthy => {
                    tracing::info!(upstream = %target, attempt, "upstream ready");
                    return true;
                }
                ProbeOutcome::Unhealthy { reason } => {
                    tracing::info!(
                        upstream = %target,
                        attempt,
                        attempts,
                        reason = %reason,
                        "upstream not ready yet"
                    );
                }
            }
            if attempt < attempts {
                tokio::time::sleep(delay).await;
            }
        }
        false
    }
}

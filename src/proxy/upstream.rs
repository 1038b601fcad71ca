//! Upstream health tracking.
//!
//! Health is asymmetric: a target becomes unhealthy only after
//! `failure_threshold` consecutive failures, and a single success
//! restores it. The prober is the only writer of failures; successful
//! forwards also reset the failure count.

use std::time::SystemTime;

use dashmap::DashMap;
use serde::Serialize;

use super::router::Target;

/// Default number of consecutive failures before a target is unhealthy.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Health status of an upstream target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Point-in-time health of one upstream target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpstreamHealth {
    pub target: String,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub last_check_time: Option<SystemTime>,
}

impl UpstreamHealth {
    fn unknown(target: &str) -> Self {
        Self {
            target: target.to_string(),
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
            last_check_time: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Tracks health status of upstream targets.
///
/// Thread-safe via DashMap; connection handlers read while the prober
/// writes. Unknown targets are considered healthy.
#[derive(Debug)]
pub struct HealthTracker {
    health: DashMap<String, UpstreamHealth>,
    failure_threshold: u32,
}

impl HealthTracker {
    /// Creates a new HealthTracker with the given failure threshold.
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            health: DashMap::new(),
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// Records a successful probe or forward.
    ///
    /// Resets the failure count and restores the target to healthy.
    pub fn record_success(&self, target: &Target) {
        let key = target.authority();
        let mut entry = self
            .health
            .entry(key.clone())
            .or_insert_with(|| UpstreamHealth::unknown(&key));
        if entry.status == HealthStatus::Unhealthy {
            tracing::info!(upstream = %key, "upstream recovered");
        }
        entry.consecutive_failures = 0;
        entry.status = HealthStatus::Healthy;
        entry.last_check_time = Some(SystemTime::now());
    }

    /// Records a failed probe.
    ///
    /// Increments the failure count. If the threshold is reached, marks
    /// the target unhealthy.
    pub fn record_failure(&self, target: &Target) {
        let key = target.authority();
        let mut entry = self
            .health
            .entry(key.clone())
            .or_insert_with(|| UpstreamHealth::unknown(&key));
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.last_check_time = Some(SystemTime::now());

        if entry.consecutive_failures >= self.failure_threshold
            && entry.status == HealthStatus::Healthy
        {
            entry.status = HealthStatus::Unhealthy;
            tracing::warn!(
                upstream = %key,
                failures = entry.consecutive_failures,
                "upstream marked unhealthy"
            );
        }
    }

    /// Returns whether a target is healthy.
    pub fn is_healthy(&self, target: &Target) -> bool {
        self.health
            .get(&target.authority())
            .map(|h| h.is_healthy())
            .unwrap_or(true)
    }

    /// Returns the current health of a target.
    pub fn snapshot(&self, target: &Target) -> UpstreamHealth {
        let key = target.authority();
        self.health
            .get(&key)
            .map(|h| h.clone())
            .unwrap_or_else(|| UpstreamHealth::unknown(&key))
    }

    /// Returns the health of every tracked target, sorted by address.
    pub fn all(&self) -> Vec<UpstreamHealth> {
        let mut all: Vec<UpstreamHealth> =
            self.health.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.target.cmp(&b.target));
        all
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD)
    }
}

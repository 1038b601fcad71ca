//! HTTP request routing, forwarding and relaying.
//!
//! Matches incoming requests to upstream targets by longest path prefix,
//! streams them upstream, streams responses back, and tracks upstream
//! health with asymmetric thresholds.

mod forwarder;
mod gateway;
mod prober;
mod relay;
mod router;
mod upstream;

pub use forwarder::{
    build_upstream_request, BoxError, Forwarder, Upstream, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_REQUEST_TIMEOUT,
};
pub use gateway::Gateway;
pub use prober::{ProbeConfig, ProbeOutcome, Prober};
pub use relay::{
    error_response, full_body, json_response, relay, strip_conflicting_length, ProxyBody,
    RelayBody, Transferred,
};
pub use router::{Route, Router, Target};
pub use upstream::{HealthStatus, HealthTracker, UpstreamHealth, DEFAULT_FAILURE_THRESHOLD};

//! Proxy error taxonomy.
//!
//! Per-request errors are converted into HTTP responses inside the
//! connection handler. Only [`ProxyError::BindFailure`] and
//! [`ProxyError::Config`] are fatal to the process.

use std::net::SocketAddr;

use hyper::StatusCode;
use thiserror::Error;

/// Errors produced while configuring, starting or running the proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// No configured route matches the request path.
    #[error("no route for path {0}")]
    RouteNotFound(String),

    /// The upstream refused the connection or could not be reached.
    #[error("upstream {upstream} refused connection: {source}")]
    UpstreamConnectionRefused {
        upstream: String,
        #[source]
        source: std::io::Error,
    },

    /// Connecting to the upstream, or waiting for its response, took too long.
    #[error("upstream {upstream} timed out during {phase}")]
    UpstreamTimeout {
        upstream: String,
        phase: &'static str,
    },

    /// The upstream closed or reset the connection before responding.
    #[error("upstream {upstream} reset connection: {reason}")]
    UpstreamConnectionReset { upstream: String, reason: String },

    /// The request could not be translated into an upstream request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The upstream is currently marked unhealthy by the prober.
    #[error("upstream {0} is marked unhealthy")]
    UpstreamUnhealthy(String),

    /// The listening socket could not be bound after all retries.
    #[error("failed to bind {addr} after {attempts} attempts: {source}")]
    BindFailure {
        addr: SocketAddr,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// IO operation failed.
    #[error("{0}: {1}")]
    Io(&'static str, #[source] std::io::Error),
}

impl ProxyError {
    /// HTTP status returned to the client for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::RouteNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamConnectionRefused { .. }
            | Self::UpstreamConnectionReset { .. }
            | Self::UpstreamUnhealthy(_) => StatusCode::BAD_GATEWAY,
            Self::BindFailure { .. } | Self::Config(_) | Self::Io(..) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Short description safe to show to clients.
    ///
    /// Never includes upstream hostnames or error chains.
    pub fn client_message(&self) -> &'static str {
        match self {
            Self::RouteNotFound(_) => "no route for requested path",
            Self::InvalidRequest(_) => "invalid request",
            Self::UpstreamConnectionRefused { .. } => "upstream unavailable",
            Self::UpstreamTimeout { .. } => "upstream timed out",
            Self::UpstreamConnectionReset { .. } => "upstream closed connection",
            Self::UpstreamUnhealthy(_) => "upstream unhealthy",
            Self::BindFailure { .. } | Self::Config(_) | Self::Io(..) => "internal proxy error",
        }
    }

    /// Whether the error is an operational alarm (warn) or routine (debug).
    pub fn is_operational(&self) -> bool {
        !matches!(self, Self::RouteNotFound(_) | Self::InvalidRequest(_))
    }
}

/// Result alias for proxy operations.
pub type Result<T, E = ProxyError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    fn refused() -> ProxyError {
        ProxyError::UpstreamConnectionRefused {
            upstream: "10.0.0.7:5000".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        }
    }

    #[test]
    fn test_route_not_found_is_404_and_not_operational() {
        let err = ProxyError::RouteNotFound("/nowhere".to_string());
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert!(!err.is_operational());
    }

    #[test]
    fn test_upstream_failures_map_to_gateway_statuses() {
        assert_eq!(refused().status(), StatusCode::BAD_GATEWAY);
        let timeout = ProxyError::UpstreamTimeout {
            upstream: "a:1".to_string(),
            phase: "connect",
        };
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        let reset = ProxyError::UpstreamConnectionReset {
            upstream: "a:1".to_string(),
            reason: "eof".to_string(),
        };
        assert_eq!(reset.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            ProxyError::UpstreamUnhealthy("a:1".to_string()).status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_client_message_hides_upstream_address() {
        let err = refused();
        assert!(err.to_string().contains("10.0.0.7"));
        assert!(!err.client_message().contains("10.0.0.7"));
    }

    #[test]
    fn test_bind_failure_names_port() {
        let err = ProxyError::BindFailure {
            addr: "0.0.0.0:3000".parse().unwrap(),
            attempts: 3,
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        let msg = err.to_string();
        assert!(msg.contains("0.0.0.0:3000"));
        assert!(msg.contains("3 attempts"));
    }
}

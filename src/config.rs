//! Command line, environment and routes-file configuration.
//!
//! Every flag can also be supplied through an environment variable so the
//! proxy runs unchanged on hosting platforms that only expose `PORT`.
//! Without a routes file a single catch-all route to
//! `TARGET_HOST:TARGET_PORT` is used.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{ArgAction, Parser};
use hyper::Method;
use serde::Deserialize;

use crate::error::{ProxyError, Result};
use crate::proxy::{ProbeConfig, Route, Target};
use crate::server::ServerOptions;

/// Streaming HTTP forwarding proxy.
#[derive(Debug, Clone, Parser)]
#[command(name = "wiz-proxy", version, about)]
pub struct Cli {
    /// Port to listen on.
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// Address to bind the listener to.
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0")]
    pub bind_addr: IpAddr,

    /// Upstream host for the default catch-all route.
    #[arg(long, env = "TARGET_HOST", default_value = "127.0.0.1")]
    pub target_host: String,

    /// Upstream port for the default catch-all route.
    #[arg(long, env = "TARGET_PORT", default_value_t = 5000)]
    pub target_port: u16,

    /// TOML file with `[[routes]]` entries; replaces the catch-all route.
    #[arg(long, env = "ROUTES_FILE")]
    pub routes_file: Option<PathBuf>,

    #[arg(long, env = "CONNECT_TIMEOUT_MS", default_value_t = 3_000)]
    pub connect_timeout_ms: u64,

    /// Bound on connect, request and upstream response headers.
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value_t = 30_000)]
    pub request_timeout_ms: u64,

    /// Probe upstreams and fail fast while they are unhealthy.
    #[arg(long, env = "HEALTH_CHECKS", default_value_t = true, action = ArgAction::Set)]
    pub health_checks: bool,

    #[arg(long, env = "HEALTH_PATH", default_value = "/")]
    pub health_path: String,

    #[arg(long, env = "HEALTH_METHOD", default_value = "HEAD")]
    pub health_method: String,

    #[arg(long, env = "HEALTH_INTERVAL_SECS", default_value_t = 30)]
    pub health_interval_secs: u64,

    #[arg(long, env = "HEALTH_TIMEOUT_MS", default_value_t = 2_000)]
    pub health_timeout_ms: u64,

    /// Consecutive failed probes before an upstream is marked unhealthy.
    #[arg(long, env = "HEALTH_FAILURE_THRESHOLD", default_value_t = 3)]
    pub health_failure_threshold: u32,

    /// Time in-flight requests get to finish after a shutdown signal.
    #[arg(long, env = "GRACE_PERIOD_SECS", default_value_t = 5)]
    pub grace_period_secs: u64,

    #[arg(long, env = "BIND_ATTEMPTS", default_value_t = 3)]
    pub bind_attempts: u32,

    #[arg(long, env = "BIND_BACKOFF_MS", default_value_t = 2_000)]
    pub bind_backoff_ms: u64,

    /// Port for `/healthz`, `/readyz` and `/upstreams`. Disabled if unset.
    #[arg(long, env = "ADMIN_PORT")]
    pub admin_port: Option<u16>,

    /// Readiness probes per upstream before accepting traffic. 0 disables.
    #[arg(long, env = "WAIT_FOR_UPSTREAM", default_value_t = 0)]
    pub wait_for_upstream: u32,

    #[arg(long, env = "WAIT_FOR_UPSTREAM_DELAY_MS", default_value_t = 1_000)]
    pub wait_for_upstream_delay_ms: u64,
}

/// Fully resolved proxy configuration. Immutable once built.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub server: ServerOptions,
    pub routes: Vec<Route>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub health_checks: bool,
    pub probe: ProbeConfig,
    pub failure_threshold: u32,
    pub admin_listen: Option<SocketAddr>,
    pub wait_for_upstream: u32,
    pub wait_for_upstream_delay: Duration,
}

impl Cli {
    /// Resolves flags, environment and the routes file into a config.
    pub fn into_config(self) -> Result<ProxyConfig> {
        let routes = match &self.routes_file {
            Some(path) => load_routes(path)?,
            None => vec![Route::new(
                "/",
                Target::new(self.target_host.clone(), self.target_port),
            )],
        };

        let method = self
            .health_method
            .to_ascii_uppercase()
            .parse::<Method>()
            .map_err(|e| {
                ProxyError::Config(format!("invalid HEALTH_METHOD '{}': {e}", self.health_method))
            })?;
        if !self.health_path.starts_with('/') {
            return Err(ProxyError::Config(format!(
                "HEALTH_PATH '{}' must start with '/'",
                self.health_path
            )));
        }

        let config = ProxyConfig {
            server: ServerOptions {
                listen: SocketAddr::new(self.bind_addr, self.port),
                bind_attempts: self.bind_attempts,
                bind_backoff: Duration::from_millis(self.bind_backoff_ms),
                grace_period: Duration::from_secs(self.grace_period_secs),
            },
            routes,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            health_checks: self.health_checks,
            probe: ProbeConfig {
                method,
                path: self.health_path,
                interval: Duration::from_secs(self.health_interval_secs),
                timeout: Duration::from_millis(self.health_timeout_ms),
            },
            failure_threshold: self.health_failure_threshold,
            admin_listen: self
                .admin_port
                .map(|port| SocketAddr::new(self.bind_addr, port)),
            wait_for_upstream: self.wait_for_upstream,
            wait_for_upstream_delay: Duration::from_millis(self.wait_for_upstream_delay_ms),
        };
        config.validate()?;
        Ok(config)
    }
}

impl ProxyConfig {
    fn validate(&self) -> Result<()> {
        let non_zero = [
            ("CONNECT_TIMEOUT_MS", self.connect_timeout),
            ("REQUEST_TIMEOUT_MS", self.request_timeout),
            ("HEALTH_TIMEOUT_MS", self.probe.timeout),
            ("HEALTH_INTERVAL_SECS", self.probe.interval),
        ];
        for (name, value) in non_zero {
            if value.is_zero() {
                return Err(ProxyError::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.server.bind_attempts == 0 {
            return Err(ProxyError::Config("BIND_ATTEMPTS must be at least 1".into()));
        }
        if self.failure_threshold == 0 {
            return Err(ProxyError::Config(
                "HEALTH_FAILURE_THRESHOLD must be at least 1".into(),
            ));
        }
        if self.routes.is_empty() {
            return Err(ProxyError::Config("no routes configured".into()));
        }
        if self.admin_listen.map(|a| a.port()) == Some(self.server.listen.port()) {
            return Err(ProxyError::Config(
                "ADMIN_PORT must differ from PORT".into(),
            ));
        }
        Ok(())
    }
}

/// On-disk routes file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RoutesFile {
    #[serde(default)]
    routes: Vec<RouteEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RouteEntry {
    path_prefix: String,
    target_host: String,
    target_port: u16,
    #[serde(default)]
    rewrite_prefix: Option<String>,
}

impl From<RouteEntry> for Route {
    fn from(entry: RouteEntry) -> Self {
        Route {
            path_prefix: entry.path_prefix,
            target: Target::new(entry.target_host, entry.target_port),
            rewrite_prefix: entry.rewrite_prefix,
        }
    }
}

/// Reads and parses a routes file.
pub fn load_routes(path: &Path) -> Result<Vec<Route>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ProxyError::Config(format!("failed to read routes file {}: {e}", path.display()))
    })?;
    parse_routes(&content)
        .map_err(|e| ProxyError::Config(format!("{}: {e}", path.display())))
}

/// Parses routes from TOML.
///
/// ```toml
/// [[routes]]
/// path_prefix = "/api"
/// target_host = "127.0.0.1"
/// target_port = 5000
/// rewrite_prefix = ""
/// ```
pub fn parse_routes(content: &str) -> Result<Vec<Route>> {
    let file: RoutesFile =
        toml::from_str(content).map_err(|e| ProxyError::Config(e.to_string()))?;
    if file.routes.is_empty() {
        return Err(ProxyError::Config("routes file defines no routes".into()));
    }
    Ok(file.routes.into_iter().map(Route::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["wiz-proxy"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults_match_source_scripts() {
        let config = cli(&[]).into_config().unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:3000".parse().unwrap());
        assert_eq!(config.routes.len(), 1);
        assert_eq!(config.routes[0].path_prefix, "/");
        assert_eq!(config.routes[0].target, Target::new("127.0.0.1", 5000));
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.probe.method, Method::HEAD);
        assert_eq!(config.probe.interval, Duration::from_secs(30));
        assert_eq!(config.probe.timeout, Duration::from_secs(2));
        assert_eq!(config.server.bind_attempts, 3);
        assert_eq!(config.server.bind_backoff, Duration::from_secs(2));
        assert_eq!(config.server.grace_period, Duration::from_secs(5));
        assert!(config.health_checks);
        assert!(config.admin_listen.is_none());
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = cli(&[
            "--port",
            "8080",
            "--target-host",
            "backend.internal",
            "--target-port",
            "9000",
            "--health-checks",
            "false",
            "--health-method",
            "get",
            "--admin-port",
            "9100",
        ])
        .into_config()
        .unwrap();
        assert_eq!(config.server.listen.port(), 8080);
        assert_eq!(config.routes[0].target, Target::new("backend.internal", 9000));
        assert!(!config.health_checks);
        assert_eq!(config.probe.method, Method::GET);
        assert_eq!(config.admin_listen.unwrap().port(), 9100);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = cli(&["--connect-timeout-ms", "0"]).into_config().unwrap_err();
        assert!(err.to_string().contains("CONNECT_TIMEOUT_MS"));
    }

    #[test]
    fn test_admin_port_must_differ() {
        assert!(cli(&["--port", "3000", "--admin-port", "3000"])
            .into_config()
            .is_err());
    }

    #[test]
    fn test_health_path_must_be_absolute() {
        assert!(cli(&["--health-path", "health"]).into_config().is_err());
    }

    #[test]
    fn test_parse_routes() {
        let routes = parse_routes(
            r#"
            [[routes]]
            path_prefix = "/api"
            target_host = "127.0.0.1"
            target_port = 5000

            [[routes]]
            path_prefix = "/blog"
            target_host = "localhost"
            target_port = 5001
            rewrite_prefix = ""
            "#,
        )
        .unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].rewrite_prefix, None);
        assert_eq!(routes[1].target, Target::new("localhost", 5001));
        assert_eq!(routes[1].rewrite_prefix.as_deref(), Some(""));
    }

    #[test]
    fn test_parse_routes_rejects_unknown_fields() {
        let err = parse_routes(
            r#"
            [[routes]]
            path_prefix = "/"
            target_host = "localhost"
            target_port = 5000
            password = "hunter2"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
    }

    #[test]
    fn test_parse_routes_rejects_empty_file() {
        assert!(parse_routes("").is_err());
    }

    #[test]
    fn test_missing_routes_file_is_config_error() {
        let err = load_routes(Path::new("/nonexistent/routes.toml")).unwrap_err();
        assert!(err.to_string().contains("routes.toml"));
    }
}

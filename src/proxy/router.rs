//! Route matching for incoming HTTP requests.
//!
//! Resolves a request path to exactly one route using longest-prefix
//! matching on path-segment boundaries. The table is built once at
//! startup and never mutated, so lookups need no locking.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};

/// An upstream host/port pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Returns `host:port`, bracketing bare IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

/// A rule mapping a path prefix to an upstream target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub path_prefix: String,
    pub target: Target,
    /// Replacement for the matched prefix. `Some("")` strips it.
    pub rewrite_prefix: Option<String>,
}

impl Route {
    pub fn new(path_prefix: impl Into<String>, target: Target) -> Self {
        Self {
            path_prefix: path_prefix.into(),
            target,
            rewrite_prefix: None,
        }
    }

    pub fn with_rewrite(mut self, rewrite_prefix: impl Into<String>) -> Self {
        self.rewrite_prefix = Some(rewrite_prefix.into());
        self
    }

    /// Rewrites an origin-form `path?query` for the upstream.
    ///
    /// Without a rewrite prefix the input is returned unchanged. The result
    /// always starts with `/` and keeps the query string.
    pub fn rewrite(&self, path_and_query: &str) -> String {
        let Some(replacement) = &self.rewrite_prefix else {
            return path_and_query.to_string();
        };

        let (path, query) = match path_and_query.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (path_and_query, None),
        };

        let rest = path.strip_prefix(self.path_prefix.as_str()).unwrap_or(path);
        let mut rewritten = join_paths(replacement, rest);
        if let Some(q) = query {
            rewritten.push('?');
            rewritten.push_str(q);
        }
        rewritten
    }

    /// Prefix matching respecting segment boundaries.
    /// /api matches /api, /api/, /api/users
    /// /api does NOT match /apikeys
    pub fn matches(&self, path: &str) -> bool {
        let prefix = self.path_prefix.as_str();
        if path == prefix {
            return true;
        }
        if path.starts_with(prefix) {
            if prefix.ends_with('/') {
                return true;
            }
            return path.as_bytes().get(prefix.len()) == Some(&b'/');
        }
        false
    }
}

/// Joins a replacement prefix and the remainder of a path with exactly one `/`.
fn join_paths(prefix: &str, rest: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let rest = rest.trim_start_matches('/');
    match (prefix.is_empty(), rest.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{rest}"),
        (false, true) => ensure_leading_slash(prefix),
        (false, false) => format!("{}/{rest}", ensure_leading_slash(prefix)),
    }
}

fn ensure_leading_slash(s: &str) -> String {
    if s.starts_with('/') {
        s.to_string()
    } else {
        format!("/{s}")
    }
}

/// Resolves request paths to routes.
///
/// Routes are kept sorted by descending prefix length so the first match
/// is the longest one. Duplicate prefixes are rejected at construction,
/// which guarantees at most one route matches any path.
#[derive(Debug, Clone)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    /// Builds the route table, validating every entry.
    pub fn new(mut routes: Vec<Route>) -> Result<Self> {
        let mut seen = HashSet::new();
        for route in &routes {
            if !route.path_prefix.starts_with('/') {
                return Err(ProxyError::Config(format!(
                    "route prefix '{}' must start with '/'",
                    route.path_prefix
                )));
            }
            if route.target.host.is_empty() {
                return Err(ProxyError::Config(format!(
                    "route '{}' has an empty target host",
                    route.path_prefix
                )));
            }
            if route.target.port == 0 {
                return Err(ProxyError::Config(format!(
                    "route '{}' has target port 0",
                    route.path_prefix
                )));
            }
            if !seen.insert(normalize_prefix(&route.path_prefix)) {
                return Err(ProxyError::Config(format!(
                    "duplicate route prefix '{}'",
                    route.path_prefix
                )));
            }
        }

        routes.sort_by(|a, b| b.path_prefix.len().cmp(&a.path_prefix.len()));
        Ok(Self { routes })
    }

    /// Finds the route for a request path.
    ///
    /// Returns `None` if no route matches.
    pub fn resolve(&self, path: &str) -> Option<&Route> {
        self.routes.iter().find(|route| route.matches(path))
    }

    /// Returns the distinct upstream targets, in route order.
    pub fn targets(&self) -> Vec<Target> {
        let mut seen = HashSet::new();
        self.routes
            .iter()
            .filter(|r| seen.insert(r.target.clone()))
            .map(|r| r.target.clone())
            .collect()
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
}

/// `/api` and `/api/` cover the same paths.
fn normalize_prefix(prefix: &str) -> &str {
    if prefix.len() > 1 {
        prefix.trim_end_matches('/')
    } else {
        prefix
    }
}

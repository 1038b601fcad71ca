//! Streaming HTTP forwarding proxy.
//!
//! Forwards requests to upstream targets chosen by longest path-prefix
//! match, streams bodies in both directions without buffering, probes
//! upstream health and drains in-flight requests on shutdown.

pub mod config;
pub mod error;
pub mod health;
pub mod proxy;
pub mod server;

pub use error::{ProxyError, Result};

#[cfg(test)]
pub(crate) mod test_util;

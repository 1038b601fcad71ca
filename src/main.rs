//! Forwarding proxy entry point.
//!
//! Reads configuration from flags and environment, starts upstream health
//! probing and the optional admin server, then serves until SIGINT or
//! SIGTERM and drains in-flight requests before exiting.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use wiz_proxy::config::Cli;
use wiz_proxy::health::{start_health_server, AdminState};
use wiz_proxy::proxy::{Forwarder, Gateway, HealthTracker, Prober, Router};
use wiz_proxy::server::ProxyServer;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Cli::parse()
        .into_config()
        .context("invalid configuration")?;
    let router = Router::new(config.routes.clone()).context("invalid route table")?;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    let tracker = Arc::new(HealthTracker::new(config.failure_threshold));
    tracing::info!(
        routes = router.routes().len(),
        health_checks = config.health_checks,
        failure_threshold = tracker.failure_threshold(),
        "wiz-proxy starting"
    );
    for route in router.routes() {
        tracing::info!(
            prefix = %route.path_prefix,
            upstream = %route.target,
            rewrite = route.rewrite_prefix.as_deref().unwrap_or("-"),
            "route configured"
        );
    }

    let prober = Prober::new(config.probe.clone(), tracker.clone());

    if config.wait_for_upstream > 0 {
        let waiting = async {
            for target in router.targets() {
                if !prober
                    .wait_until_ready(&target, config.wait_for_upstream, config.wait_for_upstream_delay)
                    .await
                {
                    tracing::warn!(upstream = %target, "upstream not ready, starting anyway");
                }
            }
        };
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("shutdown requested while waiting for upstreams");
                return Ok(());
            }
            _ = waiting => {}
        }
    }

    let probers = if config.health_checks {
        prober.spawn(router.targets(), shutdown.clone())
    } else {
        Vec::new()
    };

    let gateway = Arc::new(Gateway::new(
        router,
        Forwarder::new(config.connect_timeout, config.request_timeout),
        tracker.clone(),
        config.health_checks,
    ));

    let server = tokio::select! {
        _ = shutdown.cancelled() => {
            tracing::info!("shutdown requested before the listener was bound");
            return Ok(());
        }
        bound = ProxyServer::bind(&config.server, gateway) => {
            bound.context("proxy failed to start")?
        }
    };

    if let Some(addr) = config.admin_listen {
        let admin = AdminState {
            server_state: server.state(),
            health_tracker: tracker,
        };
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = start_health_server(addr, admin, token).await {
                tracing::error!(address = %addr, error = %e, "admin server failed");
            }
        });
    }

    server.run(shutdown.clone()).await?;

    shutdown.cancel();
    for handle in probers {
        let _ = handle.await;
    }
    Ok(())
}

/// Cancels `shutdown` on SIGINT or SIGTERM.
async fn shutdown_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
    shutdown.cancel();
}

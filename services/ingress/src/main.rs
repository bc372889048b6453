//! sni-ingress
//!
//! L4 proxy with TLS passthrough and SNI routing.
//!
//! This service:
//! - Accepts TCP connections on the configured listen address
//! - Reads the TLS ClientHello and extracts the server name
//! - Looks the server name up in a static route table
//! - Prepends a PROXY protocol v1 header and relays the connection untouched
//! - Reloads `SNI_INGRESS_ROUTES` on SIGHUP

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sni_ingress::config::{self, Config};
use sni_ingress::{Listener, ListenerConfig, RouteTable, SharedRouteTable};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to SNI_INGRESS_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting sni-ingress");
    info!(
        listen_addr = %config.listen_addr,
        route_count = config.routes.len(),
        max_connections = config.max_connections,
        idle_timeout_ms = config.session.idle_timeout.map(|d| d.as_millis() as u64),
        "Configuration loaded"
    );

    if config.routes.is_empty() {
        info!("No routes configured; every connection will be dropped");
    }

    let route_table = Arc::new(RouteTable::from_routes(config.routes.clone()));

    let listener_config = ListenerConfig {
        bind_addr: config.listen_addr,
        max_connections: config.max_connections,
        session: config.session.clone(),
    };

    #[cfg(unix)]
    spawn_route_reload(Arc::clone(&route_table))?;

    let listener = Listener::bind(listener_config, route_table)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.listen_addr))?;
    let listener = Arc::new(listener);

    tokio::select! {
        result = Arc::clone(&listener).run() => {
            if let Err(e) = &result {
                error!(error = %e, "Listener error");
            }
            result.context("listener stopped")
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
            Ok(())
        }
    }
}

/// Re-read the routes from the environment whenever SIGHUP arrives.
#[cfg(unix)]
fn spawn_route_reload(route_table: SharedRouteTable) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("failed to listen for SIGHUP")?;

    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            match config::reload_routes(&route_table, |key| std::env::var(key).ok()) {
                Ok(route_count) => info!(route_count, "Routes reloaded"),
                Err(e) => warn!(error = %e, "Route reload failed; keeping current routes"),
            }
        }
    });

    Ok(())
}

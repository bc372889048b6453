//! Ingress configuration (env-driven).

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::proxy::{
    Route, RouteTable, SessionConfig, DEFAULT_DIAL_TIMEOUT, DEFAULT_MAX_CONNECTIONS, DEFAULT_READ_SIZE,
    DEFAULT_READ_TIMEOUT,
};

/// Smallest accepted ClientHello capture size.
const MIN_READ_SIZE: usize = 16;

/// Largest accepted ClientHello capture size (one full TLS record).
const MAX_READ_SIZE: usize = 16384;

/// Ingress configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the listener binds to.
    pub listen_addr: SocketAddr,

    /// Static SNI routes.
    pub routes: Vec<Route>,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Per-session limits.
    pub session: SessionConfig,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr = lookup("SNI_INGRESS_LISTEN_ADDR")
            .unwrap_or_else(|| "[::]:443".to_string())
            .parse::<SocketAddr>()
            .context("SNI_INGRESS_LISTEN_ADDR must be a socket address (example: 0.0.0.0:443).")?;

        let routes = routes_from_lookup(&lookup)?;

        let max_connections = lookup("SNI_INGRESS_MAX_CONNECTIONS")
            .map(|v| v.parse::<usize>())
            .transpose()
            .context("SNI_INGRESS_MAX_CONNECTIONS must be an integer.")?
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(1);

        let read_size = lookup("SNI_INGRESS_READ_SIZE")
            .map(|v| v.parse::<usize>())
            .transpose()
            .context("SNI_INGRESS_READ_SIZE must be an integer (bytes).")?
            .unwrap_or(DEFAULT_READ_SIZE)
            .clamp(MIN_READ_SIZE, MAX_READ_SIZE);

        let dial_timeout = lookup_millis(&lookup, "SNI_INGRESS_DIAL_TIMEOUT_MS")?
            .unwrap_or(DEFAULT_DIAL_TIMEOUT);

        let read_timeout = lookup_millis(&lookup, "SNI_INGRESS_READ_TIMEOUT_MS")?
            .unwrap_or(DEFAULT_READ_TIMEOUT);

        let idle_timeout = lookup_millis(&lookup, "SNI_INGRESS_IDLE_TIMEOUT_MS")?;

        let log_level = lookup("SNI_INGRESS_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            routes,
            max_connections,
            session: SessionConfig {
                read_size,
                read_timeout,
                dial_timeout,
                idle_timeout,
            },
            log_level,
        })
    }
}

/// Re-read `SNI_INGRESS_ROUTES` through `lookup` and swap the result into
/// `table`. An invalid value leaves the table untouched.
pub fn reload_routes<F>(table: &RouteTable, lookup: F) -> Result<usize>
where
    F: Fn(&str) -> Option<String>,
{
    let routes = routes_from_lookup(&lookup)?;
    let route_count = routes.len();
    table.update(routes);
    Ok(route_count)
}

fn routes_from_lookup<F>(lookup: &F) -> Result<Vec<Route>>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(lookup("SNI_INGRESS_ROUTES")
        .map(|v| parse_routes(&v))
        .transpose()?
        .unwrap_or_default())
}

fn lookup_millis<F>(lookup: &F, key: &str) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    let millis = lookup(key)
        .map(|v| v.parse::<u64>())
        .transpose()
        .with_context(|| format!("{key} must be an integer (milliseconds)."))?;
    Ok(millis.map(|ms| Duration::from_millis(ms.max(1))))
}

/// Parse `hostname=host:port[,hostname=host:port...]`.
fn parse_routes(value: &str) -> Result<Vec<Route>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .parse::<Route>()
                .with_context(|| format!("invalid entry in SNI_INGRESS_ROUTES: {entry:?}"))
        })
        .collect()
}

//! Route table mapping server names to upstream addresses.
//!
//! - Exact hostname match only (no wildcards)
//! - Hostnames normalized to lowercase, trailing dot trimmed
//! - Updates replace the whole table atomically
//! - Reloads never affect established connections

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use thiserror::Error;
use tracing::{debug, info};

use super::proxy_protocol::split_host_port;
use super::resolver::UpstreamResolver;

/// A hostname bound to an upstream address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Normalized server name.
    pub hostname: String,
    /// Upstream `host:port`.
    pub upstream: String,
}

/// Errors raised while parsing a `hostname=upstream` route entry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouteParseError {
    #[error("route {0:?} is not of the form hostname=host:port")]
    MissingSeparator(String),

    #[error("route {0:?} has an empty hostname")]
    EmptyHostname(String),

    #[error("route {entry:?} has an invalid upstream address: {reason}")]
    InvalidUpstream { entry: String, reason: String },
}

impl Route {
    /// Create a route, normalizing the hostname.
    pub fn new(hostname: &str, upstream: impl Into<String>) -> Self {
        Self {
            hostname: Self::normalize_hostname(hostname),
            upstream: upstream.into(),
        }
    }

    /// Normalize a hostname for matching.
    ///
    /// - Convert to lowercase
    /// - Trim trailing dot
    pub fn normalize_hostname(hostname: &str) -> String {
        hostname.to_lowercase().trim_end_matches('.').to_string()
    }
}

impl FromStr for Route {
    type Err = RouteParseError;

    /// Parse `hostname=host:port`.
    fn from_str(entry: &str) -> Result<Self, Self::Err> {
        let (hostname, upstream) = entry
            .split_once('=')
            .ok_or_else(|| RouteParseError::MissingSeparator(entry.to_string()))?;
        let (hostname, upstream) = (hostname.trim(), upstream.trim());

        if Route::normalize_hostname(hostname).is_empty() {
            return Err(RouteParseError::EmptyHostname(entry.to_string()));
        }
        split_host_port(upstream).map_err(|e| RouteParseError::InvalidUpstream {
            entry: entry.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Route::new(hostname, upstream))
    }
}

/// Immutable snapshot of route data for lock-free reads.
#[derive(Debug, Default)]
struct RouteSnapshot {
    by_hostname: HashMap<String, Route>,
}

impl RouteSnapshot {
    fn from_routes(routes: Vec<Route>) -> Self {
        let by_hostname = routes
            .into_iter()
            .map(|route| (route.hostname.clone(), route))
            .collect();
        Self { by_hostname }
    }
}

/// Route table managing all active routes.
///
/// Uses ArcSwap for lock-free atomic config updates.
/// Readers get consistent snapshots without blocking.
/// Writers atomically swap in new snapshots.
pub struct RouteTable {
    snapshot: ArcSwap<RouteSnapshot>,
}

impl RouteTable {
    /// Create a new empty route table.
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RouteSnapshot::default()),
        }
    }

    /// Create a route table pre-populated with `routes`.
    pub fn from_routes(routes: Vec<Route>) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RouteSnapshot::from_routes(routes)),
        }
    }

    /// Replace the entire route table atomically in a single pointer swap.
    ///
    /// Sessions that already resolved keep their upstream.
    pub fn update(&self, routes: Vec<Route>) {
        let route_count = routes.len();
        self.snapshot
            .store(Arc::new(RouteSnapshot::from_routes(routes)));

        info!(route_count = route_count, "Route table updated atomically");
    }

    /// Look up the route for a server name.
    pub fn get(&self, hostname: &str) -> Option<Route> {
        let normalized = Route::normalize_hostname(hostname);
        self.snapshot.load().by_hostname.get(&normalized).cloned()
    }

    /// Get the total number of routes.
    pub fn len(&self) -> usize {
        self.snapshot.load().by_hostname.len()
    }

    /// Check if the route table is empty.
    pub fn is_empty(&self) -> bool {
        self.snapshot.load().by_hostname.is_empty()
    }

    /// Get all routed hostnames.
    pub fn hostnames(&self) -> Vec<String> {
        self.snapshot.load().by_hostname.keys().cloned().collect()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamResolver for RouteTable {
    fn resolve(&self, hostname: &str) -> Option<String> {
        let route = self.get(hostname);
        match &route {
            Some(route) => debug!(
                hostname = %route.hostname,
                upstream = %route.upstream,
                "Route matched by SNI"
            ),
            None => debug!(hostname = %hostname, "No route for hostname"),
        }
        route.map(|r| r.upstream)
    }
}

/// Shared route table reference.
pub type SharedRouteTable = Arc<RouteTable>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_hostname() {
        assert_eq!(Route::normalize_hostname("Example.COM"), "example.com");
        assert_eq!(Route::normalize_hostname("example.com."), "example.com");
        assert_eq!(Route::normalize_hostname("EXAMPLE.COM."), "example.com");
    }

    #[test]
    fn test_route_table_update() {
        let table = RouteTable::new();

        table.update(vec![
            Route::new("example.com", "127.0.0.1:9443"),
            Route::new("example.org", "127.0.0.1:9444"),
        ]);

        assert_eq!(table.len(), 2);
        assert!(table.get("example.com").is_some());
        assert!(table.get("example.org").is_some());

        // A full update replaces, it does not merge
        table.update(vec![Route::new("example.net", "127.0.0.1:9445")]);
        assert_eq!(table.hostnames(), vec!["example.net".to_string()]);
    }

    #[test]
    fn test_resolve_normalizes_server_name() {
        let table = RouteTable::from_routes(vec![Route::new("Example.com.", "10.0.0.2:443")]);

        assert_eq!(table.resolve("EXAMPLE.COM").as_deref(), Some("10.0.0.2:443"));
        assert_eq!(table.resolve("example.com.").as_deref(), Some("10.0.0.2:443"));
        assert!(table.resolve("www.example.com").is_none());
    }

    #[test]
    fn test_parse_route() {
        let route: Route = " Example.com = [::1]:8443 ".parse().unwrap();
        assert_eq!(route, Route::new("example.com", "[::1]:8443"));

        assert!(matches!(
            "example.com".parse::<Route>(),
            Err(RouteParseError::MissingSeparator(_))
        ));
        assert!(matches!(
            "=10.0.0.1:443".parse::<Route>(),
            Err(RouteParseError::EmptyHostname(_))
        ));
        assert!(matches!(
            "example.com=10.0.0.1".parse::<Route>(),
            Err(RouteParseError::InvalidUpstream { .. })
        ));
    }
}

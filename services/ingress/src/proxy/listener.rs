//! TCP listener and connection handling.
//!
//! Accepts connections, caps how many are served at once and hands each
//! one to [`SniProxy`] inside its own task and tracing span. A failing
//! session never affects other sessions or the accept loop.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn, Instrument};

use super::resolver::SharedResolver;
use super::session::{DropReason, SessionConfig, SessionOutcome, SniProxy};

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Per-session limits.
    pub session: SessionConfig,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            session: SessionConfig::default(),
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Sessions relayed to an upstream.
    pub sessions_relayed: AtomicU64,
    /// Sessions whose first bytes were not a usable ClientHello.
    pub sni_failed: AtomicU64,
    /// Sessions with a server name but no route.
    pub routes_failed: AtomicU64,
    /// Upstream connection failures.
    pub upstream_failed: AtomicU64,
    /// Sessions that ended with any other error.
    pub sessions_failed: AtomicU64,
    /// Bytes proxied to upstreams (excluding PROXY header and replay).
    pub bytes_to_upstream: AtomicU64,
    /// Bytes proxied from upstreams.
    pub bytes_from_upstream: AtomicU64,
}

impl ListenerStats {
    fn record(&self, result: &Result<SessionOutcome, super::ProxyError>) {
        match result {
            Ok(SessionOutcome::Relayed { stats, .. }) => {
                self.sessions_relayed.fetch_add(1, Ordering::Relaxed);
                self.bytes_to_upstream
                    .fetch_add(stats.a_to_b, Ordering::Relaxed);
                self.bytes_from_upstream
                    .fetch_add(stats.b_to_a, Ordering::Relaxed);
            }
            Ok(SessionOutcome::Dropped(DropReason::NoRoute)) => {
                self.routes_failed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(SessionOutcome::Dropped(_)) => {
                self.sni_failed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.is_upstream_unavailable() => {
                self.upstream_failed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.sessions_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// A TCP listener for the SNI proxy.
pub struct Listener {
    /// The TCP listener.
    listener: TcpListener,
    /// Session handler shared by every connection.
    proxy: SniProxy,
    /// Connection semaphore for limiting concurrent connections.
    conn_semaphore: Arc<Semaphore>,
    /// Statistics.
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Create a new listener.
    pub async fn bind(config: ListenerConfig, resolver: SharedResolver) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            read_size = config.session.read_size,
            dial_timeout_ms = config.session.dial_timeout.as_millis() as u64,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            proxy: SniProxy::with_config(config.session, resolver),
            listener,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Run the listener, accepting and handling connections.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    // Try to acquire a permit
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);

                    tokio::spawn(
                        async move {
                            listener.handle_connection(stream).await;

                            listener
                                .stats
                                .connections_active
                                .fetch_sub(1, Ordering::Relaxed);
                            listener
                                .stats
                                .connections_closed
                                .fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Handle a single connection.
    async fn handle_connection(&self, client: TcpStream) {
        let result = self.proxy.serve(client).await;
        self.stats.record(&result);

        match result {
            Ok(SessionOutcome::Relayed {
                server_name,
                upstream,
                stats,
            }) => {
                debug!(
                    server_name = %server_name,
                    upstream = %upstream,
                    bytes_to_upstream = stats.a_to_b,
                    bytes_from_upstream = stats.b_to_a,
                    "Connection closed"
                );
            }
            Ok(SessionOutcome::Dropped(reason)) => {
                debug!(
                    reason = reason.as_str(),
                    state = %reason.state(),
                    "Connection dropped"
                );
            }
            Err(e) => {
                debug!(
                    state = %e.state(),
                    reason = e.reason_code(),
                    error = %e,
                    "Connection error"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{ProxyError, PumpStats};

    #[test]
    fn test_listener_config_default() {
        let config = ListenerConfig::new("[::]:443".parse().unwrap());
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.session, SessionConfig::default());
    }

    #[test]
    fn test_listener_stats_record() {
        let stats = ListenerStats::default();

        stats.record(&Ok(SessionOutcome::Relayed {
            server_name: "example.com".to_string(),
            upstream: "127.0.0.1:9443".to_string(),
            stats: PumpStats {
                a_to_b: 10,
                b_to_a: 20,
            },
        }));
        stats.record(&Ok(SessionOutcome::Dropped(DropReason::NoRoute)));
        stats.record(&Ok(SessionOutcome::Dropped(DropReason::NotClientHello)));
        stats.record(&Err(ProxyError::DialTimeout {
            upstream: "127.0.0.1:9443".to_string(),
            timeout: Duration::from_secs(2),
        }));
        stats.record(&Err(ProxyError::ClientClosed));

        assert_eq!(stats.sessions_relayed.load(Ordering::Relaxed), 1);
        assert_eq!(stats.bytes_to_upstream.load(Ordering::Relaxed), 10);
        assert_eq!(stats.bytes_from_upstream.load(Ordering::Relaxed), 20);
        assert_eq!(stats.routes_failed.load(Ordering::Relaxed), 1);
        assert_eq!(stats.sni_failed.load(Ordering::Relaxed), 1);
        assert_eq!(stats.upstream_failed.load(Ordering::Relaxed), 1);
        assert_eq!(stats.sessions_failed.load(Ordering::Relaxed), 1);
    }
}

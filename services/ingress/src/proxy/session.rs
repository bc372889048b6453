//! SNI passthrough session handling.
//!
//! One [`SniProxy::serve`] call owns one inbound connection for its whole
//! life:
//!
//! ```text
//! Idle -> Reading -> Sniffing -> Resolving -> Dialing
//!      -> SendingHeader -> Replaying -> Pumping -> Closed
//! ```
//!
//! `Closed` is reached from every state. Both sockets are owned by the call
//! and dropped on every exit path. Nothing is retried.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::error::ProxyError;
use super::proxy_protocol::{split_host_port, ProxyHeaderV1};
use super::pump::{ConnectionPump, PumpStats, DEFAULT_IDLE_TIMEOUT};
use super::resolver::SharedResolver;
use super::sni::{parse_client_hello, SniResult};

/// Default capture size for the ClientHello.
pub const DEFAULT_READ_SIZE: usize = 1024;

/// Default timeout for the initial ClientHello read.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Default connect timeout for upstream connections.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-session limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Capacity of the single ClientHello read. A hard ceiling.
    pub read_size: usize,
    /// Maximum time to wait for the ClientHello.
    pub read_timeout: Duration,
    /// Maximum time to establish the upstream connection.
    pub dial_timeout: Duration,
    /// Idle timeout while pumping. `None` keeps stalled sessions open.
    pub idle_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_size: DEFAULT_READ_SIZE,
            read_timeout: DEFAULT_READ_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Lifecycle state of a session.
///
/// `Idle` and `Closed` bound the lifecycle: no error is raised in either.
/// Failures report the state they were raised in through
/// [`ProxyError::state`], drops through [`DropReason::state`], and every
/// session ends in `Closed` (see [`SessionOutcome::state`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Reading,
    Sniffing,
    Resolving,
    Dialing,
    SendingHeader,
    Replaying,
    Pumping,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Reading => "reading",
            SessionState::Sniffing => "sniffing",
            SessionState::Resolving => "resolving",
            SessionState::Dialing => "dialing",
            SessionState::SendingHeader => "sending_header",
            SessionState::Replaying => "replaying",
            SessionState::Pumping => "pumping",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session was closed without being proxied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The captured bytes are not a parseable TLS ClientHello.
    NotClientHello,
    /// The ClientHello carries no (or an empty) server name.
    MissingServerName,
    /// The resolver has no upstream for the server name.
    NoRoute,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::NotClientHello => "not_client_hello",
            DropReason::MissingServerName => "missing_server_name",
            DropReason::NoRoute => "no_route",
        }
    }

    /// State in which the session was dropped.
    pub fn state(&self) -> SessionState {
        match self {
            DropReason::NotClientHello | DropReason::MissingServerName => SessionState::Sniffing,
            DropReason::NoRoute => SessionState::Resolving,
        }
    }
}

/// How a session that did not fail ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Traffic was relayed to the upstream until one side finished.
    Relayed {
        server_name: String,
        upstream: String,
        stats: PumpStats,
    },
    /// Closed before dialing; not a fault of the proxy.
    Dropped(DropReason),
}

impl SessionOutcome {
    /// Final state of a session that returned normally.
    pub fn state(&self) -> SessionState {
        SessionState::Closed
    }
}

/// SNI-aware TCP proxy speaking PROXY protocol v1 to its upstreams.
///
/// Captures the TLS ClientHello, extracts the server name, resolves the
/// upstream, sends a PROXY header, replays the captured bytes and then
/// relays traffic without decrypting it.
pub struct SniProxy {
    config: SessionConfig,
    resolver: SharedResolver,
    pump: ConnectionPump,
}

impl SniProxy {
    /// Create a proxy with default limits.
    pub fn new(resolver: SharedResolver) -> Self {
        Self::with_config(SessionConfig::default(), resolver)
    }

    /// Create a proxy with custom limits.
    pub fn with_config(config: SessionConfig, resolver: SharedResolver) -> Self {
        Self {
            pump: ConnectionPump::with_idle_timeout(config.idle_timeout),
            config,
            resolver,
        }
    }

    /// Session limits in use.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Serve one inbound connection to completion.
    pub async fn serve(&self, mut inbound: TcpStream) -> Result<SessionOutcome, ProxyError> {
        // Reading
        let prefix = self.capture_prefix(&mut inbound).await?;

        // Sniffing
        let server_name = match parse_client_hello(&prefix) {
            SniResult::Found(name) if !name.is_empty() => name,
            SniResult::Found(_) | SniResult::NoSni => {
                debug!("server_name missing");
                return Ok(SessionOutcome::Dropped(DropReason::MissingServerName));
            }
            other => {
                debug!(
                    result = other.as_str(),
                    bytes = prefix.len(),
                    "TLS handshake not recognized"
                );
                return Ok(SessionOutcome::Dropped(DropReason::NotClientHello));
            }
        };
        debug!(server_name = %server_name, "SNI extracted");

        // Resolving
        let upstream = match self.resolve(&server_name).await? {
            Some(upstream) => upstream,
            None => {
                debug!(server_name = %server_name, "No route for server name");
                return Ok(SessionOutcome::Dropped(DropReason::NoRoute));
            }
        };

        // Dialing
        let mut outbound = self.dial(&upstream).await?;
        debug!(upstream = %upstream, "Connected to upstream");

        // SendingHeader
        let header = proxy_header(&inbound, &outbound, &upstream)?;
        if let Err(e) = write_flushed(&mut outbound, &header).await {
            warn!(upstream = %upstream, error = %e, "Sending PROXY protocol header failed");
            return Err(ProxyError::SendHeader(e));
        }

        // Replaying
        if let Err(e) = write_flushed(&mut outbound, &prefix).await {
            warn!(upstream = %upstream, error = %e, "Replaying client hello failed");
            return Err(ProxyError::Replay(e));
        }

        // Pumping
        match self.pump.pump(inbound, outbound).await {
            Ok(stats) => Ok(SessionOutcome::Relayed {
                server_name,
                upstream,
                stats,
            }),
            Err(e) => {
                warn!(upstream = %upstream, error = %e, "Relaying traffic failed");
                Err(ProxyError::Pump(e))
            }
        }
    }

    /// Single bounded read of the first bytes the client sends.
    async fn capture_prefix(&self, inbound: &mut TcpStream) -> Result<Vec<u8>, ProxyError> {
        // A zero-length read would be indistinguishable from EOF.
        let mut buffer = vec![0u8; self.config.read_size.max(1)];

        let bytes_read = match timeout(self.config.read_timeout, inbound.read(&mut buffer)).await {
            Ok(Ok(0)) => return Err(ProxyError::ClientClosed),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(ProxyError::Read(e)),
            Err(_) => return Err(ProxyError::ReadTimeout(self.config.read_timeout)),
        };

        buffer.truncate(bytes_read);
        Ok(buffer)
    }

    /// Ask the resolver on the blocking pool; empty addresses mean no route.
    async fn resolve(&self, server_name: &str) -> Result<Option<String>, ProxyError> {
        let resolver = Arc::clone(&self.resolver);
        let hostname = server_name.to_string();

        let upstream = tokio::task::spawn_blocking(move || resolver.resolve(&hostname))
            .await
            .map_err(|e| ProxyError::Resolver(e.to_string()))?;

        Ok(upstream.filter(|addr| !addr.is_empty()))
    }

    async fn dial(&self, upstream: &str) -> Result<TcpStream, ProxyError> {
        match timeout(self.config.dial_timeout, TcpStream::connect(upstream)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => {
                warn!(upstream = %upstream, error = %e, "Cannot connect to upstream");
                Err(ProxyError::Dial {
                    upstream: upstream.to_string(),
                    source: e,
                })
            }
            Err(_) => {
                warn!(
                    upstream = %upstream,
                    timeout_ms = self.config.dial_timeout.as_millis() as u64,
                    "Upstream connect timeout"
                );
                Err(ProxyError::DialTimeout {
                    upstream: upstream.to_string(),
                    timeout: self.config.dial_timeout,
                })
            }
        }
    }
}

/// Build the PROXY header for this session.
///
/// Source is the client's address. Destination is the resolved upstream;
/// when it names a host rather than an IP, the dialed peer's IP is used.
fn proxy_header(
    inbound: &TcpStream,
    outbound: &TcpStream,
    upstream: &str,
) -> Result<Vec<u8>, ProxyError> {
    let src_addr = inbound.peer_addr().map_err(ProxyError::SocketAddr)?;

    let (host, port) = split_host_port(upstream).inspect_err(|e| {
        warn!(upstream = %upstream, error = %e, "Parsing destination address failed");
    })?;
    let dst_ip = match host.parse::<IpAddr>() {
        Ok(ip) => ip,
        Err(_) => outbound.peer_addr().map_err(ProxyError::SocketAddr)?.ip(),
    };

    let header = ProxyHeaderV1::new(src_addr, SocketAddr::new(dst_ip, port));
    let bytes = header.encode().inspect_err(|e| {
        warn!(error = %e, "Encoding PROXY protocol header failed");
    })?;
    Ok(bytes)
}

async fn write_flushed(stream: &mut TcpStream, bytes: &[u8]) -> std::io::Result<()> {
    stream.write_all(bytes).await?;
    stream.flush().await
}

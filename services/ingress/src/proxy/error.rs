//! Session error types.

use std::io;
use std::time::Duration;

use thiserror::Error;

use super::proxy_protocol::ProxyHeaderError;
use super::session::SessionState;

/// Failure of a single proxied session.
///
/// Each variant ends the session; nothing is retried. Recognised-but-
/// unroutable connections are not errors and never show up here.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Reading the ClientHello from the client failed.
    #[error("reading client hello failed: {0}")]
    Read(#[source] io::Error),

    /// Client closed the connection before sending anything.
    #[error("client closed before sending a client hello")]
    ClientClosed,

    /// Client sent nothing within the read timeout.
    #[error("no client hello within {0:?}")]
    ReadTimeout(Duration),

    /// The resolver task panicked or was cancelled.
    #[error("resolver failed: {0}")]
    Resolver(String),

    /// Could not connect to the upstream.
    #[error("cannot connect to upstream {upstream}: {source}")]
    Dial {
        upstream: String,
        #[source]
        source: io::Error,
    },

    /// Connecting to the upstream took longer than the dial timeout.
    #[error("connecting to upstream {upstream} timed out after {timeout:?}")]
    DialTimeout { upstream: String, timeout: Duration },

    /// A socket address needed for the PROXY header was unavailable.
    #[error("socket address unavailable: {0}")]
    SocketAddr(#[source] io::Error),

    /// The PROXY header could not be built.
    #[error("building PROXY header failed: {0}")]
    Header(#[from] ProxyHeaderError),

    /// Writing the PROXY header to the upstream failed.
    #[error("sending PROXY header failed: {0}")]
    SendHeader(#[source] io::Error),

    /// Replaying the captured ClientHello to the upstream failed.
    #[error("replaying client hello failed: {0}")]
    Replay(#[source] io::Error),

    /// Relaying traffic failed after the handshake was replayed.
    #[error("relaying traffic failed: {0}")]
    Pump(#[source] io::Error),
}

impl ProxyError {
    /// State the session was in when it failed.
    pub fn state(&self) -> SessionState {
        match self {
            ProxyError::Read(_) | ProxyError::ClientClosed | ProxyError::ReadTimeout(_) => {
                SessionState::Reading
            }
            ProxyError::Resolver(_) => SessionState::Resolving,
            ProxyError::Dial { .. } | ProxyError::DialTimeout { .. } => SessionState::Dialing,
            ProxyError::SocketAddr(_) | ProxyError::Header(_) | ProxyError::SendHeader(_) => {
                SessionState::SendingHeader
            }
            ProxyError::Replay(_) => SessionState::Replaying,
            ProxyError::Pump(_) => SessionState::Pumping,
        }
    }

    /// Standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ProxyError::Read(_) => "read_failed",
            ProxyError::ClientClosed => "client_closed",
            ProxyError::ReadTimeout(_) => "read_timeout",
            ProxyError::Resolver(_) => "resolver_failed",
            ProxyError::Dial { .. } => "dial_failed",
            ProxyError::DialTimeout { .. } => "dial_timeout",
            ProxyError::SocketAddr(_) => "socket_addr_unavailable",
            ProxyError::Header(_) => "proxy_header_invalid",
            ProxyError::SendHeader(_) => "proxy_header_send_failed",
            ProxyError::Replay(_) => "replay_failed",
            ProxyError::Pump(_) => "pump_failed",
        }
    }

    /// Whether the upstream could not be reached.
    pub fn is_upstream_unavailable(&self) -> bool {
        matches!(self, ProxyError::Dial { .. } | ProxyError::DialTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_map_to_failing_state() {
        assert_eq!(ProxyError::ClientClosed.state(), SessionState::Reading);
        assert_eq!(
            ProxyError::DialTimeout {
                upstream: "10.0.0.1:443".to_string(),
                timeout: Duration::from_secs(2),
            }
            .state(),
            SessionState::Dialing
        );
        assert_eq!(
            ProxyError::Header(ProxyHeaderError::InvalidPort("x".to_string())).state(),
            SessionState::SendingHeader
        );
        assert_eq!(
            ProxyError::Pump(io::Error::from(io::ErrorKind::ConnectionReset)).state(),
            SessionState::Pumping
        );
    }

    #[test]
    fn test_upstream_unavailable() {
        let err = ProxyError::Dial {
            upstream: "10.0.0.1:443".to_string(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert!(err.is_upstream_unavailable());
        assert_eq!(err.reason_code(), "dial_failed");
        assert!(!ProxyError::ClientClosed.is_upstream_unavailable());
    }
}

//! L4 SNI passthrough proxy.
//!
//! This module provides:
//! - TCP listener management
//! - SNI extraction from the TLS ClientHello
//! - Upstream resolution through an injected resolver
//! - PROXY protocol v1 injection
//! - Bidirectional connection pumping
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> SniProxy -> ClientHello sniffer -> Resolver -> Upstream
//!                                                                         |
//!                                        PROXY v1 header + replayed ClientHello
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{Listener, ListenerConfig, Route, RouteTable};
//!
//! let routes = Arc::new(RouteTable::from_routes(vec![
//!     Route::new("example.com", "10.0.0.2:443"),
//! ]));
//!
//! let config = ListenerConfig::new("[::]:443".parse()?);
//! let listener = Arc::new(Listener::bind(config, routes).await?);
//! listener.run().await?;
//! ```

mod error;
mod listener;
mod proxy_protocol;
mod pump;
mod resolver;
mod router;
mod session;
mod sni;

pub use error::ProxyError;
pub use listener::{Listener, ListenerConfig, ListenerStats, DEFAULT_MAX_CONNECTIONS};
pub use proxy_protocol::{
    encode as encode_proxy_header, parse_proxy_v1, split_host_port, AddressFamily,
    ProxyHeaderError, ProxyHeaderV1, PROXY_V1_MAX_LEN,
};
pub use pump::{ConnectionPump, Direction, PumpStats, COPY_BUFFER_SIZE};
pub use resolver::{SharedResolver, UpstreamResolver};
pub use router::{Route, RouteParseError, RouteTable, SharedRouteTable};
pub use session::{
    DropReason, SessionConfig, SessionOutcome, SessionState, SniProxy, DEFAULT_DIAL_TIMEOUT,
    DEFAULT_READ_SIZE, DEFAULT_READ_TIMEOUT,
};
pub use sni::{extract_server_name, parse_client_hello, SniResult};

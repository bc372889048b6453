pub mod config;
pub mod proxy;

pub use proxy::{
    extract_server_name, Listener, ListenerConfig, ProxyError, Route, RouteTable, SessionOutcome,
    SharedResolver, SharedRouteTable, SniProxy, SniResult, UpstreamResolver,
};

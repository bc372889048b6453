//! Upstream resolution capability.
//!
//! The proxy never decides where traffic goes on its own; it asks an
//! injected [`UpstreamResolver`] to map the requested server name to an
//! upstream address.

use std::sync::Arc;

/// Maps a server name to an upstream `host:port` address.
///
/// Implementations are shared by every session and may be called
/// concurrently. Calls run on the blocking thread pool, so a resolver may
/// block without stalling other sessions.
pub trait UpstreamResolver: Send + Sync {
    /// Returns the upstream address for `hostname`, or `None` when there is
    /// no route. An empty string is treated the same as `None`.
    fn resolve(&self, hostname: &str) -> Option<String>;
}

impl<F> UpstreamResolver for F
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn resolve(&self, hostname: &str) -> Option<String> {
        self(hostname)
    }
}

/// Shared resolver reference.
pub type SharedResolver = Arc<dyn UpstreamResolver>;

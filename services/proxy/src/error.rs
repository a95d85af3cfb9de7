//! Error types for the proxy core.

use thiserror::Error;

/// Errors surfaced by the cluster manager, load balancers and connections.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// No route in the TCP proxy config matched the connection.
    #[error("no_route_match: local {local_addr}, peer {peer_addr}")]
    NoRouteMatch {
        local_addr: String,
        peer_addr: String,
    },

    /// A route or host update referenced a cluster that was never configured.
    #[error("unknown_cluster: {0}")]
    UnknownCluster(String),

    /// The cluster exists but currently has no hosts.
    #[error("no_healthy_upstream: cluster {0}")]
    NoHealthyUpstream(String),

    /// Host selection was attempted on an empty host set.
    #[error("no_available_host")]
    NoAvailableHost,

    /// A host in an update was rejected.
    #[error("invalid_host: {address}: {detail}")]
    InvalidHost { address: String, detail: String },

    /// Configuration failed validation.
    #[error("invalid_config: {0}")]
    InvalidConfig(String),

    /// The connection has already been closed and released.
    #[error("connection_closed")]
    ConnectionClosed,

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ProxyError::NoRouteMatch { .. } => "no_route_match",
            ProxyError::UnknownCluster(_) => "unknown_cluster",
            ProxyError::NoHealthyUpstream(_) => "no_healthy_upstream",
            ProxyError::NoAvailableHost => "no_available_host",
            ProxyError::InvalidHost { .. } => "invalid_host",
            ProxyError::InvalidConfig(_) => "invalid_config",
            ProxyError::ConnectionClosed => "connection_closed",
            ProxyError::Io(_) => "io_error",
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ProxyError>;

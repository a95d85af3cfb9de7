//! mesh-proxy
//!
//! L4 (TCP) data plane for a service mesh. Listeners accept client
//! connections, run them through a read filter chain and relay them to an
//! upstream host picked from a named cluster.

pub mod config;
pub mod error;
pub mod filter;
pub mod network;
pub mod server;
pub mod upstream;

pub use config::{
    BootstrapConfig, ClusterConfig, ClusterType, HostConfig, LbType, ListenerConfig,
    TcpProxyConfig, TcpRoute,
};
pub use error::{ProxyError, Result};
pub use filter::{TcpProxyFilterFactory, TcpProxyStats};
pub use network::{
    CloseType, Connection, ConnectionCallbacks, ConnectionEvent, ConnectionHandle, FilterStatus,
    NetworkFilterFactory, ReadFilter, ReadFilterCallbacks,
};
pub use server::Server;
pub use upstream::{Cluster, ClusterManager, Host, LoadBalancer};

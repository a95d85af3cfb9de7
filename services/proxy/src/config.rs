//! Proxy configuration.
//!
//! The data plane is configured through explicit update calls
//! (`update_cluster_config`, `update_cluster_hosts`, `add_listener`). The
//! shapes below are what those calls accept; the binary additionally reads
//! them from a JSON bootstrap file and takes process settings from the
//! environment.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};

/// Default per-connection buffer limit (32 KiB).
pub const DEFAULT_CONN_BUFFER_LIMIT_BYTES: u32 = 32 * 1024;

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Default connect timeout for upstream connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default deadline for a single read attempt.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(15);

/// Default bound on a flush-then-close.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Listener name, used in logs.
    pub name: String,
    /// Address to bind to.
    pub addr: SocketAddr,
    /// Bind the listening socket when the server starts.
    #[serde(default = "default_true")]
    pub bind_to_port: bool,
    /// Write buffer limit for accepted connections.
    #[serde(default = "default_conn_buffer_limit")]
    pub conn_buffer_limit_bytes: u32,
    /// Maximum concurrent connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Consecutive idle read deadlines before an accepted connection is
    /// closed. Unset keeps idle connections open.
    #[serde(default)]
    pub max_read_timeouts: Option<u32>,
}

impl ListenerConfig {
    /// Create a listener configuration with defaults.
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
            bind_to_port: true,
            conn_buffer_limit_bytes: DEFAULT_CONN_BUFFER_LIMIT_BYTES,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_read_timeouts: None,
        }
    }
}

/// A single TCP proxy route.
///
/// A route without match criteria matches every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpRoute {
    /// Target cluster name.
    pub cluster: String,
    /// Only match connections accepted on this local port.
    #[serde(default)]
    pub destination_port: Option<u16>,
    /// Only match connections from one of these source IPs.
    #[serde(default)]
    pub source_addrs: Vec<IpAddr>,
}

impl TcpRoute {
    /// Create a catch-all route to a cluster.
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            destination_port: None,
            source_addrs: Vec::new(),
        }
    }
}

/// TCP proxy filter configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpProxyConfig {
    /// Routes, evaluated in order.
    pub routes: Vec<TcpRoute>,
}

impl TcpProxyConfig {
    /// Configuration with a single default route.
    pub fn single_route(cluster: impl Into<String>) -> Self {
        Self {
            routes: vec![TcpRoute::new(cluster)],
        }
    }
}

/// How a cluster's membership is sourced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterType {
    /// Static host list supplied with the config.
    #[default]
    Simple,
    /// Hosts are pushed later by a discovery collaborator.
    Dynamic,
}

/// Load-balancing policy tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LbType {
    /// Weighted random selection.
    #[default]
    Random,
    /// Round robin over the host set.
    RoundRobin,
}

/// Cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Unique cluster name.
    pub name: String,
    #[serde(default)]
    pub cluster_type: ClusterType,
    #[serde(default)]
    pub lb_type: LbType,
    /// Request limit per upstream connection. Carried for L7 extensions;
    /// raw byte relay does not count requests.
    #[serde(default = "default_max_request_per_conn")]
    pub max_request_per_conn: u32,
    /// Write buffer limit for upstream connections.
    #[serde(default = "default_conn_buffer_limit")]
    pub conn_buffer_limit_bytes: u32,
    /// Upstream connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Consecutive idle read deadlines before an upstream connection is
    /// closed. Unset keeps idle connections open.
    #[serde(default)]
    pub max_read_timeouts: Option<u32>,
}

impl ClusterConfig {
    /// Create a cluster configuration with defaults.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cluster_type: ClusterType::default(),
            lb_type: LbType::default(),
            max_request_per_conn: default_max_request_per_conn(),
            conn_buffer_limit_bytes: DEFAULT_CONN_BUFFER_LIMIT_BYTES,
            connect_timeout_ms: default_connect_timeout_ms(),
            max_read_timeouts: None,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Check the invariants an update must satisfy.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ProxyError::InvalidConfig(
                "cluster name must not be empty".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ProxyError::InvalidConfig(format!(
                "cluster {}: connect_timeout_ms must be positive",
                self.name
            )));
        }
        if self.max_read_timeouts == Some(0) {
            return Err(ProxyError::InvalidConfig(format!(
                "cluster {}: max_read_timeouts must be positive",
                self.name
            )));
        }
        Ok(())
    }
}

/// Host configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    pub address: SocketAddr,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl HostConfig {
    pub fn new(address: SocketAddr, weight: u32) -> Self {
        Self { address, weight }
    }
}

/// A listener entry in the bootstrap file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerBootstrap {
    #[serde(flatten)]
    pub listener: ListenerConfig,
    pub tcp_proxy: TcpProxyConfig,
}

/// A cluster entry in the bootstrap file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterBootstrap {
    #[serde(flatten)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

/// Full static configuration read by the binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub listeners: Vec<ListenerBootstrap>,
    #[serde(default)]
    pub clusters: Vec<ClusterBootstrap>,
}

impl BootstrapConfig {
    /// Parse a bootstrap document from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ProxyError::InvalidConfig(e.to_string()))
    }

    /// Read and parse a bootstrap file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Routes that reference clusters missing from this document.
    ///
    /// Not an error: clusters may be added later through the cluster manager.
    pub fn dangling_routes(&self) -> Vec<(String, String)> {
        self.listeners
            .iter()
            .flat_map(|l| {
                l.tcp_proxy
                    .routes
                    .iter()
                    .filter(|r| !self.clusters.iter().any(|c| c.cluster.name == r.cluster))
                    .map(|r| (l.listener.name.clone(), r.cluster.clone()))
            })
            .collect()
    }
}

/// Process configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Bootstrap file with listeners and clusters.
    pub bootstrap_path: PathBuf,

    /// How long shutdown waits for connections to drain.
    pub shutdown_grace: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let bootstrap_path = std::env::var("MESH_BOOTSTRAP")
            .map(PathBuf::from)
            .context("Missing bootstrap path. Set MESH_BOOTSTRAP.")?;

        let shutdown_grace_ms: u64 = std::env::var("MESH_SHUTDOWN_GRACE_MS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("MESH_SHUTDOWN_GRACE_MS must be an integer (milliseconds).")?
            .unwrap_or(5000);
        let shutdown_grace = Duration::from_millis(shutdown_grace_ms.max(100));

        let log_level = std::env::var("MESH_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            bootstrap_path,
            shutdown_grace,
            log_level,
        })
    }
}

fn default_true() -> bool {
    true
}

fn default_conn_buffer_limit() -> u32 {
    DEFAULT_CONN_BUFFER_LIMIT_BYTES
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

fn default_max_request_per_conn() -> u32 {
    1024
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT.as_millis() as u64
}

fn default_weight() -> u32 {
    1
}

//! Upstream hosts and per-priority host sets.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::HostConfig;

/// An upstream endpoint of one cluster.
///
/// Hosts are never mutated; updates replace a cluster's whole host set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    cluster: Arc<str>,
    address: SocketAddr,
    weight: u32,
}

impl Host {
    pub fn new(cluster: Arc<str>, address: SocketAddr, weight: u32) -> Self {
        Self {
            cluster,
            address,
            weight,
        }
    }

    pub(crate) fn from_config(cluster: &Arc<str>, config: &HostConfig) -> Self {
        Self::new(Arc::clone(cluster), config.address, config.weight)
    }

    /// Name of the owning cluster.
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }
}

/// Host sets keyed by priority (0 is the most preferred).
#[derive(Debug, Clone, Default)]
pub struct PrioritySet {
    tiers: BTreeMap<u32, Arc<[Host]>>,
}

impl PrioritySet {
    /// Copy of this set with one priority's hosts replaced. An empty host
    /// list removes the tier.
    pub fn with_hosts(&self, priority: u32, hosts: Vec<Host>) -> Self {
        let mut tiers = self.tiers.clone();
        if hosts.is_empty() {
            tiers.remove(&priority);
        } else {
            tiers.insert(priority, hosts.into());
        }
        Self { tiers }
    }

    /// Hosts of the most preferred non-empty priority.
    pub fn healthy_hosts(&self) -> &[Host] {
        self.tiers
            .values()
            .next()
            .map(|hosts| &hosts[..])
            .unwrap_or(&[])
    }

    /// Hosts at one priority.
    pub fn hosts(&self, priority: u32) -> &[Host] {
        self.tiers.get(&priority).map(|hosts| &hosts[..]).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// Total hosts across all priorities.
    pub fn host_count(&self) -> usize {
        self.tiers.values().map(|hosts| hosts.len()).sum()
    }
}

//! Cluster manager.
//!
//! Clusters live in an atomically swappable map. Every update builds a new
//! [`Cluster`] value and publishes a new map, so a reader that loaded a
//! cluster sees either the whole old state or the whole new state, never a
//! mix. Concurrent writers are serialized by read-copy-update, and the last
//! writer for a cluster wins.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{debug, info};

use super::host::{Host, PrioritySet};
use super::load_balancer::{load_balancer_for, LoadBalancer};
use crate::config::{ClusterConfig, HostConfig};
use crate::error::{ProxyError, Result};

/// Immutable snapshot of one cluster.
#[derive(Debug, Clone)]
pub struct Cluster {
    name: Arc<str>,
    config: ClusterConfig,
    priority_set: PrioritySet,
    load_balancer: Arc<dyn LoadBalancer>,
}

impl Cluster {
    fn new(config: ClusterConfig) -> Self {
        Self {
            name: Arc::from(config.name.as_str()),
            load_balancer: Arc::from(load_balancer_for(config.lb_type)),
            priority_set: PrioritySet::default(),
            config,
        }
    }

    /// Copy with a replaced config. Hosts are kept; the load balancer is
    /// rebuilt only if the policy changed.
    fn with_config(&self, config: ClusterConfig) -> Self {
        let load_balancer = if config.lb_type == self.config.lb_type {
            Arc::clone(&self.load_balancer)
        } else {
            Arc::from(load_balancer_for(config.lb_type))
        };
        Self {
            name: Arc::clone(&self.name),
            config,
            priority_set: self.priority_set.clone(),
            load_balancer,
        }
    }

    fn with_hosts(&self, priority: u32, hosts: Vec<Host>) -> Self {
        Self {
            name: Arc::clone(&self.name),
            config: self.config.clone(),
            priority_set: self.priority_set.with_hosts(priority, hosts),
            load_balancer: Arc::clone(&self.load_balancer),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn priority_set(&self) -> &PrioritySet {
        &self.priority_set
    }

    /// Hosts eligible for selection.
    pub fn hosts(&self) -> &[Host] {
        self.priority_set.healthy_hosts()
    }

    /// Pick a host with the cluster's load balancer.
    pub fn choose_host(&self) -> Result<&Host> {
        let hosts = self.hosts();
        if hosts.is_empty() {
            return Err(ProxyError::NoHealthyUpstream(self.name.to_string()));
        }
        self.load_balancer.choose_host(hosts)
    }
}

type ClusterMap = HashMap<String, Arc<Cluster>>;

/// Registry of upstream clusters.
pub struct ClusterManager {
    clusters: ArcSwap<ClusterMap>,
}

impl ClusterManager {
    pub fn new() -> Self {
        Self {
            clusters: ArcSwap::from_pointee(ClusterMap::new()),
        }
    }

    /// Insert or replace a cluster's configuration.
    ///
    /// Replacing keeps the cluster's current hosts.
    pub fn update_cluster_config(&self, config: ClusterConfig) -> Result<()> {
        config.validate()?;
        let name = config.name.clone();

        self.clusters.rcu(|current| {
            let cluster = match current.get(&name) {
                Some(existing) => existing.with_config(config.clone()),
                None => Cluster::new(config.clone()),
            };
            let mut next = ClusterMap::clone(current);
            next.insert(name.clone(), Arc::new(cluster));
            next
        });

        info!(
            cluster = %name,
            lb_type = ?config.lb_type,
            cluster_type = ?config.cluster_type,
            "Cluster config updated"
        );
        Ok(())
    }

    /// Replace the host set of one priority. An empty set is legal and makes
    /// the cluster unroutable until hosts are added again.
    pub fn update_cluster_hosts(
        &self,
        name: &str,
        priority: u32,
        hosts: Vec<HostConfig>,
    ) -> Result<()> {
        if let Some(bad) = hosts.iter().find(|h| h.weight == 0) {
            return Err(ProxyError::InvalidHost {
                address: bad.address.to_string(),
                detail: "weight must be positive".to_string(),
            });
        }
        let host_count = hosts.len();

        let mut missing = false;
        self.clusters.rcu(|current| {
            let Some(existing) = current.get(name) else {
                missing = true;
                return Arc::clone(current);
            };
            missing = false;
            let cluster_name = Arc::clone(&existing.name);
            let hosts = hosts
                .iter()
                .map(|h| Host::from_config(&cluster_name, h))
                .collect();
            let mut next = ClusterMap::clone(current);
            next.insert(name.to_string(), Arc::new(existing.with_hosts(priority, hosts)));
            Arc::new(next)
        });

        if missing {
            return Err(ProxyError::UnknownCluster(name.to_string()));
        }

        info!(cluster = %name, priority, host_count, "Cluster hosts updated");
        Ok(())
    }

    /// Snapshot of a cluster.
    pub fn get_cluster(&self, name: &str) -> Option<Arc<Cluster>> {
        self.clusters.load().get(name).cloned()
    }

    /// Remove a cluster. Returns whether it existed.
    pub fn remove_cluster(&self, name: &str) -> bool {
        let mut removed = false;
        self.clusters.rcu(|current| {
            removed = current.contains_key(name);
            if !removed {
                return Arc::clone(current);
            }
            let mut next = ClusterMap::clone(current);
            next.remove(name);
            Arc::new(next)
        });
        if removed {
            info!(cluster = %name, "Cluster removed");
        }
        removed
    }

    /// Names of all configured clusters, sorted.
    pub fn cluster_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clusters.load().keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve a cluster and pick one of its hosts.
    pub fn choose_host(&self, name: &str) -> Result<SocketAddr> {
        let cluster = self
            .get_cluster(name)
            .ok_or_else(|| ProxyError::UnknownCluster(name.to_string()))?;
        let host = cluster.choose_host()?;
        debug!(cluster = %name, host = %host.address(), "Host selected");
        Ok(host.address())
    }

    pub fn len(&self) -> usize {
        self.clusters.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.load().is_empty()
    }
}

impl Default for ClusterManager {
    fn default() -> Self {
        Self::new()
    }
}

//! Upstream clusters, hosts and load balancing.
//!
//! The [`ClusterManager`] is the only process-wide mutable structure. Readers
//! take a snapshot of a cluster and select from it without locking; writers
//! swap whole clusters in.

mod cluster_manager;
mod host;
mod load_balancer;

pub use cluster_manager::{Cluster, ClusterManager};
pub use host::{Host, PrioritySet};
pub use load_balancer::{
    load_balancer_for, LoadBalancer, RandomLoadBalancer, RoundRobinLoadBalancer,
};

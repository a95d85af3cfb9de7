//! Host selection policies.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

use super::host::Host;
use crate::config::LbType;
use crate::error::{ProxyError, Result};

/// Picks one host from a host set.
pub trait LoadBalancer: Send + Sync + fmt::Debug {
    /// Choose a host. An empty set yields [`ProxyError::NoAvailableHost`].
    fn choose_host<'a>(&self, hosts: &'a [Host]) -> Result<&'a Host>;
}

/// Build the load balancer for a policy tag.
pub fn load_balancer_for(lb_type: LbType) -> Box<dyn LoadBalancer> {
    match lb_type {
        LbType::Random => Box::new(RandomLoadBalancer),
        LbType::RoundRobin => Box::new(RoundRobinLoadBalancer::default()),
    }
}

/// Weighted random selection: each host is picked with probability
/// weight / total weight.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomLoadBalancer;

impl RandomLoadBalancer {
    /// Choose with a caller-provided random source.
    pub fn choose_host_with<'a, R: Rng + ?Sized>(
        &self,
        hosts: &'a [Host],
        rng: &mut R,
    ) -> Result<&'a Host> {
        let total: u64 = hosts.iter().map(|h| u64::from(h.weight())).sum();
        if total == 0 {
            return Err(ProxyError::NoAvailableHost);
        }

        let mut pick = rng.random_range(0..total);
        for host in hosts {
            let weight = u64::from(host.weight());
            if pick < weight {
                return Ok(host);
            }
            pick -= weight;
        }
        Err(ProxyError::NoAvailableHost)
    }
}

impl LoadBalancer for RandomLoadBalancer {
    fn choose_host<'a>(&self, hosts: &'a [Host]) -> Result<&'a Host> {
        self.choose_host_with(hosts, &mut rand::rng())
    }
}

/// Round robin over the host set, ignoring weights.
#[derive(Debug, Default)]
pub struct RoundRobinLoadBalancer {
    rr_counter: AtomicUsize,
}

impl LoadBalancer for RoundRobinLoadBalancer {
    fn choose_host<'a>(&self, hosts: &'a [Host]) -> Result<&'a Host> {
        if hosts.is_empty() {
            return Err(ProxyError::NoAvailableHost);
        }
        let idx = self.rr_counter.fetch_add(1, Ordering::Relaxed) % hosts.len();
        Ok(&hosts[idx])
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rstest::rstest;

    use super::*;

    fn hosts(weights: &[u32]) -> Vec<Host> {
        let cluster: Arc<str> = Arc::from("tstCluster");
        weights
            .iter()
            .enumerate()
            .map(|(i, weight)| {
                Host::new(
                    Arc::clone(&cluster),
                    SocketAddr::from(([127, 0, 0, 1], 8080 + i as u16)),
                    *weight,
                )
            })
            .collect()
    }

    #[rstest]
    #[case(&[100])]
    #[case(&[1, 1])]
    #[case(&[1, 3])]
    #[case(&[10, 20, 70])]
    #[case(&[5, 1, 1, 1])]
    fn test_weighted_selection_frequency(#[case] weights: &[u32]) {
        const TRIALS: usize = 100_000;
        let hosts = hosts(weights);
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut counts = vec![0usize; hosts.len()];

        for _ in 0..TRIALS {
            let chosen = RandomLoadBalancer
                .choose_host_with(&hosts, &mut rng)
                .unwrap();
            let idx = hosts.iter().position(|h| h == chosen).unwrap();
            counts[idx] += 1;
        }

        let total: u32 = weights.iter().sum();
        for (i, weight) in weights.iter().enumerate() {
            let expected = *weight as f64 / total as f64;
            let observed = counts[i] as f64 / TRIALS as f64;
            assert!(
                (observed - expected).abs() < 0.01,
                "host {} expected {:.3} observed {:.3}",
                i,
                expected,
                observed
            );
        }
    }

    #[test]
    fn test_single_host_always_chosen() {
        let hosts = hosts(&[7]);
        for _ in 0..100 {
            let chosen = RandomLoadBalancer.choose_host(&hosts).unwrap();
            assert_eq!(chosen.address().port(), 8080);
        }
    }

    #[rstest]
    #[case(load_balancer_for(LbType::Random))]
    #[case(load_balancer_for(LbType::RoundRobin))]
    fn test_empty_set_has_no_host(#[case] lb: Box<dyn LoadBalancer>) {
        let err = lb.choose_host(&[]).unwrap_err();
        assert_eq!(err.reason_code(), "no_available_host");
    }

    #[test]
    fn test_round_robin_cycles() {
        let hosts = hosts(&[1, 100, 1]);
        let lb = RoundRobinLoadBalancer::default();

        let ports: Vec<u16> = (0..6)
            .map(|_| lb.choose_host(&hosts).unwrap().address().port())
            .collect();
        assert_eq!(ports, vec![8080, 8081, 8082, 8080, 8081, 8082]);
    }
}

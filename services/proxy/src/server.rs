//! Proxy server: listeners, the shared cluster manager and shutdown.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::{ClusterConfig, HostConfig, ListenerConfig};
use crate::error::{ProxyError, Result};
use crate::network::{Listener, ListenerStats, NetworkFilterFactory};
use crate::upstream::ClusterManager;

/// Default time `close` waits for connections to drain.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct ListenerEntry {
    name: String,
    /// `None` when the listener does not bind to its port.
    listener: Option<Arc<Listener>>,
    task: Option<JoinHandle<io::Result<()>>>,
}

/// Owns the listeners and the shutdown signal.
pub struct Server {
    cluster_manager: Arc<ClusterManager>,
    shutdown_tx: watch::Sender<bool>,
    listeners: Vec<ListenerEntry>,
    shutdown_grace: Duration,
    started: bool,
}

impl Server {
    pub fn new(cluster_manager: Arc<ClusterManager>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            cluster_manager,
            shutdown_tx,
            listeners: Vec::new(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            started: false,
        }
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn cluster_manager(&self) -> Arc<ClusterManager> {
        Arc::clone(&self.cluster_manager)
    }

    /// Receiver that flips to `true` when the server closes.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn update_cluster_config(&self, config: ClusterConfig) -> Result<()> {
        self.cluster_manager.update_cluster_config(config)
    }

    pub fn update_cluster_hosts(
        &self,
        cluster: &str,
        priority: u32,
        hosts: Vec<HostConfig>,
    ) -> Result<()> {
        self.cluster_manager
            .update_cluster_hosts(cluster, priority, hosts)
    }

    /// Register a listener, binding it unless `bind_to_port` is false.
    ///
    /// Returns the bound address. Listeners added after `start` begin
    /// accepting immediately.
    pub async fn add_listener(
        &mut self,
        config: ListenerConfig,
        factories: Vec<Arc<dyn NetworkFilterFactory>>,
    ) -> Result<Option<SocketAddr>> {
        if self.listeners.iter().any(|l| l.name == config.name) {
            return Err(ProxyError::InvalidConfig(format!(
                "duplicate listener name: {}",
                config.name
            )));
        }

        let name = config.name.clone();
        let listener = if config.bind_to_port {
            Some(Arc::new(Listener::bind(config, factories).await?))
        } else {
            info!(listener = %name, "Listener registered without binding");
            None
        };
        let local_addr = match &listener {
            Some(listener) => Some(listener.local_addr()?),
            None => None,
        };

        self.listeners.push(ListenerEntry {
            name,
            listener,
            task: None,
        });
        if self.started {
            self.start();
        }
        Ok(local_addr)
    }

    /// Stats of a bound listener.
    pub fn listener_stats(&self, name: &str) -> Option<Arc<ListenerStats>> {
        self.listeners
            .iter()
            .find(|l| l.name == name)
            .and_then(|l| l.listener.as_ref())
            .map(|l| l.stats())
    }

    /// Start accept loops for every bound listener not yet running.
    pub fn start(&mut self) {
        self.started = true;
        for entry in &mut self.listeners {
            let Some(listener) = &entry.listener else {
                continue;
            };
            if entry.task.is_some() {
                continue;
            }
            let listener = Arc::clone(listener);
            let shutdown = self.shutdown_tx.subscribe();
            let name = entry.name.clone();
            entry.task = Some(tokio::spawn(async move {
                let result = listener.run(shutdown).await;
                if let Err(e) = &result {
                    error!(listener = %name, error = %e, "Listener error");
                }
                result
            }));
        }
    }

    /// Signal shutdown, stop accepting and wait for connections to drain.
    pub async fn close(self) {
        info!(listener_count = self.listeners.len(), "Shutting down");
        self.shutdown_tx.send_replace(true);

        let deadline = Instant::now() + self.shutdown_grace;

        for mut entry in self.listeners {
            if let Some(task) = entry.task.take() {
                if let Err(e) = task.await {
                    warn!(listener = %entry.name, error = %e, "Listener task failed");
                }
            }
            if let Some(listener) = entry.listener {
                listener
                    .drain(deadline.saturating_duration_since(Instant::now()))
                    .await;
            }
        }
        info!("Shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TcpProxyConfig;
    use crate::filter::TcpProxyFilterFactory;

    fn factories(server: &Server) -> Vec<Arc<dyn NetworkFilterFactory>> {
        let factory: Arc<dyn NetworkFilterFactory> = Arc::new(TcpProxyFilterFactory::new(
            TcpProxyConfig::single_route("c"),
            server.cluster_manager(),
        ));
        vec![factory]
    }

    #[tokio::test]
    async fn test_duplicate_listener_rejected() {
        let mut server = Server::new(Arc::new(ClusterManager::new()));
        let config = ListenerConfig::new("l", "127.0.0.1:0".parse().unwrap());

        let addr = server
            .add_listener(config.clone(), factories(&server))
            .await
            .unwrap();
        assert!(addr.is_some());

        let err = server
            .add_listener(config, factories(&server))
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "invalid_config");
        server.close().await;
    }

    #[tokio::test]
    async fn test_unbound_listener() {
        let mut server = Server::new(Arc::new(ClusterManager::new()));
        let mut config = ListenerConfig::new("l", "127.0.0.1:0".parse().unwrap());
        config.bind_to_port = false;

        let addr = server.add_listener(config, factories(&server)).await.unwrap();
        assert!(addr.is_none());
        assert!(server.listener_stats("l").is_none());

        server.start();
        server.close().await;
    }

    #[tokio::test]
    async fn test_close_raises_shutdown_signal() {
        let mut server = Server::new(Arc::new(ClusterManager::new()))
            .with_shutdown_grace(Duration::from_millis(200));
        let config = ListenerConfig::new("l", "127.0.0.1:0".parse().unwrap());
        server.add_listener(config, factories(&server)).await.unwrap();
        server.start();

        let signal = server.shutdown_signal();
        assert!(!*signal.borrow());
        server.close().await;
        assert!(*signal.borrow());
    }
}

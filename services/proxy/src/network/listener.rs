//! TCP listener.
//!
//! Accepts connections, builds each connection's filter chain from the
//! listener's factories and runs the connection on its own task.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

use super::connection::{Connection, ConnectionConfig};
use super::shutdown_signalled;
use crate::config::ListenerConfig;

/// Builds the read filters for a freshly accepted connection.
///
/// Called once per connection; filters must be fresh instances.
pub trait NetworkFilterFactory: Send + Sync {
    fn create_filter_chain(&self, connection: &mut Connection);
}

/// Holds one of a listener's connection slots.
///
/// Clones share the slot, which is released when the last clone drops.
/// Tasks started on behalf of an accepted connection (such as its upstream)
/// carry a clone so [`Listener::drain`] waits for them too.
#[derive(Debug, Clone)]
pub struct DrainGuard(Arc<OwnedSemaphorePermit>);

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
}

/// A bound TCP listener.
pub struct Listener {
    config: ListenerConfig,
    listener: TcpListener,
    factories: Vec<Arc<dyn NetworkFilterFactory>>,
    /// Connection semaphore for limiting concurrent connections.
    conn_semaphore: Arc<Semaphore>,
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind the listening socket.
    pub async fn bind(
        config: ListenerConfig,
        factories: Vec<Arc<dyn NetworkFilterFactory>>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            listener = %config.name,
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            config,
            factories,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections until the shutdown signal is raised.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(listener = %self.config.name, bind_addr = %local_addr, "Listener started");

        let mut stop = shutdown.clone();
        loop {
            let accepted = tokio::select! {
                _ = shutdown_signalled(&mut stop) => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(
                                peer_addr = %peer_addr,
                                "Connection rejected: max connections reached"
                            );
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let mut connection = Connection::accepted(
                        stream,
                        peer_addr,
                        ConnectionConfig::for_listener(&self.config),
                        shutdown.clone(),
                    );
                    connection.set_drain_guard(DrainGuard(Arc::new(permit)));
                    for factory in &self.factories {
                        factory.create_filter_chain(&mut connection);
                    }

                    let id = connection.id();
                    let stats = Arc::clone(&self.stats);
                    tokio::spawn(
                        async move {
                            debug!("Connection accepted");
                            connection.run().await;

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                        }
                        .instrument(tracing::info_span!("connection", id = %id, peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        info!(listener = %self.config.name, "Listener stopped accepting");
        Ok(())
    }

    /// Wait for accepted connections and everything holding their
    /// [`DrainGuard`] to finish, up to `grace`.
    ///
    /// Returns false if connections were still open when the grace period ended.
    pub async fn drain(&self, grace: Duration) -> bool {
        let permits = u32::try_from(self.config.max_connections).unwrap_or(u32::MAX);
        match tokio::time::timeout(grace, self.conn_semaphore.acquire_many(permits)).await {
            Ok(_) => true,
            Err(_) => {
                warn!(
                    listener = %self.config.name,
                    active = self.stats.connections_active.load(Ordering::Relaxed),
                    "Connections still open after grace period"
                );
                false
            }
        }
    }
}

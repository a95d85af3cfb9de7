//! TCP proxy filter.
//!
//! Installed on a downstream connection, it resolves a route to a cluster,
//! picks a host and dials it, then relays bytes both ways:
//!
//! ```text
//! client <-> downstream Connection [TcpProxy] ==writes==> upstream Connection
//!                                  <==writes== [UpstreamRelay]
//! ```
//!
//! Downstream data is withheld (the chain is halted) until the upstream is
//! connected. Watermark events on either side pause or resume reading on the
//! other side, and a close on either side closes the other with a flush.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tracing::{debug, info_span, Instrument};

use crate::config::{TcpProxyConfig, TcpRoute};
use crate::error::{ProxyError, Result};
use crate::network::{
    CloseType, Connection, ConnectionConfig, ConnectionEvent, ConnectionHandle, FilterStatus,
    NetworkFilterFactory, ReadFilter, ReadFilterCallbacks,
};
use crate::upstream::ClusterManager;

/// Counters shared by every TCP proxy built from one factory.
#[derive(Debug, Default)]
pub struct TcpProxyStats {
    /// Downstream connections handled.
    pub downstream_cx_total: AtomicU64,
    /// Downstream connections that matched no route.
    pub downstream_cx_no_route: AtomicU64,
    /// Routes naming a cluster that is not configured.
    pub upstream_cx_unknown_cluster: AtomicU64,
    /// Clusters with no hosts at selection time.
    pub upstream_cx_no_healthy: AtomicU64,
    /// Upstream dials started.
    pub upstream_cx_total: AtomicU64,
    /// Upstream dials that failed or timed out.
    pub upstream_cx_connect_fail: AtomicU64,
    /// Downstream reads paused because the upstream write buffer was full.
    pub downstream_flow_control_paused_reading_total: AtomicU64,
    pub downstream_flow_control_resumed_reading_total: AtomicU64,
    /// Upstream reads paused because the downstream write buffer was full.
    pub upstream_flow_control_paused_reading_total: AtomicU64,
    pub upstream_flow_control_resumed_reading_total: AtomicU64,
    /// Bytes relayed client to upstream.
    pub bytes_to_upstream: AtomicU64,
    /// Bytes relayed upstream to client.
    pub bytes_from_upstream: AtomicU64,
}

impl TcpProxyStats {
    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// First route matching a connection, in configuration order.
///
/// A route with a `destination_port` never matches when the local address is
/// unknown.
pub fn select_route(
    config: &TcpProxyConfig,
    local_addr: Option<SocketAddr>,
    remote_ip: IpAddr,
) -> Option<&TcpRoute> {
    config.routes.iter().find(|route| {
        let port_ok = match route.destination_port {
            Some(port) => local_addr.map(|a| a.port()) == Some(port),
            None => true,
        };
        let source_ok = route.source_addrs.is_empty() || route.source_addrs.contains(&remote_ip);
        port_ok && source_ok
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProxyState {
    Init,
    Connecting,
    Proxying,
    Closing,
    Failed,
}

/// Downstream half of the proxy.
pub struct TcpProxy {
    config: Arc<TcpProxyConfig>,
    cluster_manager: Arc<ClusterManager>,
    stats: Arc<TcpProxyStats>,
    callbacks: Option<ReadFilterCallbacks>,
    upstream: Option<ConnectionHandle>,
    state: ProxyState,
}

impl TcpProxy {
    pub fn new(
        config: Arc<TcpProxyConfig>,
        cluster_manager: Arc<ClusterManager>,
        stats: Arc<TcpProxyStats>,
    ) -> Self {
        Self {
            config,
            cluster_manager,
            stats,
            callbacks: None,
            upstream: None,
            state: ProxyState::Init,
        }
    }

    /// Resolve route, cluster and host, then start the upstream connection.
    fn connect_upstream(&self, callbacks: &ReadFilterCallbacks) -> Result<ConnectionHandle> {
        let remote_addr = callbacks.remote_addr();
        let local_addr = callbacks.local_addr();

        let route = select_route(&self.config, local_addr, remote_addr.ip()).ok_or_else(|| {
            ProxyError::NoRouteMatch {
                local_addr: local_addr.map(|a| a.to_string()).unwrap_or_default(),
                peer_addr: remote_addr.to_string(),
            }
        })?;
        let cluster = self
            .cluster_manager
            .get_cluster(&route.cluster)
            .ok_or_else(|| ProxyError::UnknownCluster(route.cluster.clone()))?;
        let host = cluster.choose_host()?;
        let host_addr = host.address();

        let mut upstream = Connection::client(
            host_addr,
            ConnectionConfig::for_cluster(cluster.config()),
            callbacks.shutdown_signal(),
        );
        // The listener's drain waits for the upstream as well.
        if let Some(guard) = callbacks.drain_guard() {
            upstream.set_drain_guard(guard);
        }
        upstream.add_read_filter(Box::new(UpstreamRelay {
            downstream: callbacks.connection().clone(),
            stats: Arc::clone(&self.stats),
        }));
        let handle = upstream.handle();

        debug!(
            cluster = %cluster.name(),
            host = %host_addr,
            upstream_id = %handle.id(),
            "Connecting upstream"
        );
        tokio::spawn(upstream.run().instrument(info_span!(
            "upstream",
            id = %handle.id(),
            cluster = %cluster.name(),
            host = %host_addr
        )));
        TcpProxyStats::inc(&self.stats.upstream_cx_total);

        Ok(handle)
    }

    fn record_failure(&self, err: &ProxyError) {
        let counter = match err {
            ProxyError::NoRouteMatch { .. } => &self.stats.downstream_cx_no_route,
            ProxyError::UnknownCluster(_) => &self.stats.upstream_cx_unknown_cluster,
            ProxyError::NoHealthyUpstream(_) | ProxyError::NoAvailableHost => {
                &self.stats.upstream_cx_no_healthy
            }
            _ => return,
        };
        TcpProxyStats::inc(counter);
    }
}

impl ReadFilter for TcpProxy {
    fn initialize_read_filter_callbacks(&mut self, callbacks: ReadFilterCallbacks) {
        self.callbacks = Some(callbacks);
    }

    fn on_new_connection(&mut self) -> FilterStatus {
        let Some(callbacks) = self.callbacks.clone() else {
            return FilterStatus::Continue;
        };
        TcpProxyStats::inc(&self.stats.downstream_cx_total);

        match self.connect_upstream(&callbacks) {
            Ok(upstream) => {
                self.upstream = Some(upstream);
                self.state = ProxyState::Connecting;
            }
            Err(e) => {
                debug!(
                    peer_addr = %callbacks.remote_addr(),
                    reason = e.reason_code(),
                    error = %e,
                    "Closing downstream"
                );
                self.record_failure(&e);
                self.state = ProxyState::Failed;
                callbacks.connection().close(CloseType::NoFlush);
            }
        }
        // Data waits until the upstream is connected.
        FilterStatus::StopIteration
    }

    fn on_continue(&mut self) {
        // Resumed by the upstream relay once the upstream is connected.
        if self.state == ProxyState::Connecting {
            self.state = ProxyState::Proxying;
        }
    }

    fn on_data(&mut self, data: &mut BytesMut, _end_stream: bool) -> FilterStatus {
        match (self.state, &self.upstream) {
            (ProxyState::Proxying, Some(upstream)) => {
                if !data.is_empty() {
                    self.stats
                        .bytes_to_upstream
                        .fetch_add(data.len() as u64, Ordering::Relaxed);
                    let _ = upstream.write(data.split().freeze());
                }
            }
            // Held until the upstream connects.
            (ProxyState::Connecting, _) => {}
            _ => data.clear(),
        }
        FilterStatus::StopIteration
    }

    fn on_event(&mut self, event: ConnectionEvent) {
        match event {
            event if event.is_close() => {
                if let Some(upstream) = self.upstream.take() {
                    upstream.close(CloseType::FlushWrite);
                }
                if self.state != ProxyState::Failed {
                    self.state = ProxyState::Closing;
                }
            }
            ConnectionEvent::AboveWriteBufferHighWatermark => {
                if let Some(upstream) = &self.upstream {
                    upstream.set_read_disabled(true);
                    TcpProxyStats::inc(&self.stats.upstream_flow_control_paused_reading_total);
                }
            }
            ConnectionEvent::BelowWriteBufferLowWatermark => {
                if let Some(upstream) = &self.upstream {
                    upstream.set_read_disabled(false);
                    TcpProxyStats::inc(&self.stats.upstream_flow_control_resumed_reading_total);
                }
            }
            _ => {}
        }
    }
}

/// Upstream half of the proxy: relays upstream bytes to the downstream
/// connection and reports upstream lifecycle back to it.
struct UpstreamRelay {
    downstream: ConnectionHandle,
    stats: Arc<TcpProxyStats>,
}

impl ReadFilter for UpstreamRelay {
    fn on_data(&mut self, data: &mut BytesMut, _end_stream: bool) -> FilterStatus {
        if !data.is_empty() {
            self.stats
                .bytes_from_upstream
                .fetch_add(data.len() as u64, Ordering::Relaxed);
            let _ = self.downstream.write(data.split().freeze());
        }
        FilterStatus::Continue
    }

    fn on_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {
                debug!(downstream_id = %self.downstream.id(), "Upstream connected");
                self.downstream.continue_reading();
            }
            ConnectionEvent::ConnectFailed | ConnectionEvent::ConnectTimeout => {
                TcpProxyStats::inc(&self.stats.upstream_cx_connect_fail);
                self.downstream.close(CloseType::NoFlush);
            }
            ConnectionEvent::LocalClose | ConnectionEvent::RemoteClose => {
                self.downstream.close(CloseType::FlushWrite);
            }
            ConnectionEvent::AboveWriteBufferHighWatermark => {
                self.downstream.set_read_disabled(true);
                TcpProxyStats::inc(&self.stats.downstream_flow_control_paused_reading_total);
            }
            ConnectionEvent::BelowWriteBufferLowWatermark => {
                self.downstream.set_read_disabled(false);
                TcpProxyStats::inc(&self.stats.downstream_flow_control_resumed_reading_total);
            }
        }
    }
}

/// Installs a [`TcpProxy`] on every accepted connection.
pub struct TcpProxyFilterFactory {
    config: Arc<TcpProxyConfig>,
    cluster_manager: Arc<ClusterManager>,
    stats: Arc<TcpProxyStats>,
}

impl TcpProxyFilterFactory {
    pub fn new(config: TcpProxyConfig, cluster_manager: Arc<ClusterManager>) -> Self {
        Self {
            config: Arc::new(config),
            cluster_manager,
            stats: Arc::new(TcpProxyStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<TcpProxyStats> {
        Arc::clone(&self.stats)
    }
}

impl NetworkFilterFactory for TcpProxyFilterFactory {
    fn create_filter_chain(&self, connection: &mut Connection) {
        connection.add_read_filter(Box::new(TcpProxy::new(
            Arc::clone(&self.config),
            Arc::clone(&self.cluster_manager),
            Arc::clone(&self.stats),
        )));
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn routes() -> TcpProxyConfig {
        TcpProxyConfig {
            routes: vec![
                TcpRoute {
                    cluster: "by_port".to_string(),
                    destination_port: Some(9000),
                    source_addrs: Vec::new(),
                },
                TcpRoute {
                    cluster: "by_source".to_string(),
                    destination_port: None,
                    source_addrs: vec!["10.0.0.7".parse().unwrap()],
                },
                TcpRoute::new("default"),
            ],
        }
    }

    #[rstest]
    #[case(Some("127.0.0.1:9000"), "10.0.0.7", "by_port")]
    #[case(Some("127.0.0.1:9001"), "10.0.0.7", "by_source")]
    #[case(Some("127.0.0.1:9001"), "10.0.0.8", "default")]
    #[case(None, "10.0.0.8", "default")]
    #[case(None, "10.0.0.7", "by_source")]
    fn test_first_matching_route_wins(
        #[case] local: Option<&str>,
        #[case] remote: &str,
        #[case] expected: &str,
    ) {
        let config = routes();
        let local = local.map(|a| a.parse().unwrap());
        let route = select_route(&config, local, remote.parse().unwrap()).unwrap();
        assert_eq!(route.cluster, expected);
    }

    #[test]
    fn test_no_route_without_catch_all() {
        let mut config = routes();
        config.routes.pop();
        assert!(select_route(&config, None, "10.0.0.8".parse().unwrap()).is_none());
        let empty = TcpProxyConfig::default();
        assert!(select_route(&empty, None, "10.0.0.8".parse().unwrap()).is_none());
    }

    fn proxy() -> TcpProxy {
        TcpProxy::new(
            Arc::new(TcpProxyConfig::default()),
            Arc::new(ClusterManager::new()),
            Arc::new(TcpProxyStats::default()),
        )
    }

    #[test]
    fn test_proxying_starts_when_upstream_connects() {
        let mut proxy = proxy();
        proxy.state = ProxyState::Connecting;

        let mut data = BytesMut::from(&b"early"[..]);
        assert_eq!(proxy.on_data(&mut data, false), FilterStatus::StopIteration);
        assert_eq!(&data[..], b"early", "data is held while connecting");

        proxy.on_continue();
        assert_eq!(proxy.state, ProxyState::Proxying);

        proxy.on_event(ConnectionEvent::RemoteClose);
        assert_eq!(proxy.state, ProxyState::Closing);
        proxy.on_continue();
        assert_eq!(proxy.state, ProxyState::Closing);
    }

    #[test]
    fn test_failed_proxy_discards_data() {
        let mut proxy = proxy();
        proxy.state = ProxyState::Failed;

        let mut data = BytesMut::from(&b"dropped"[..]);
        proxy.on_data(&mut data, false);
        assert!(data.is_empty());

        proxy.on_event(ConnectionEvent::LocalClose);
        assert_eq!(proxy.state, ProxyState::Failed);
    }

    #[test]
    fn test_failure_counters() {
        let proxy = proxy();
        proxy.record_failure(&ProxyError::NoRouteMatch {
            local_addr: String::new(),
            peer_addr: String::new(),
        });
        proxy.record_failure(&ProxyError::UnknownCluster("c".to_string()));
        proxy.record_failure(&ProxyError::NoHealthyUpstream("c".to_string()));
        proxy.record_failure(&ProxyError::ConnectionClosed);

        let stats = &proxy.stats;
        assert_eq!(stats.downstream_cx_no_route.load(Ordering::Relaxed), 1);
        assert_eq!(stats.upstream_cx_unknown_cluster.load(Ordering::Relaxed), 1);
        assert_eq!(stats.upstream_cx_no_healthy.load(Ordering::Relaxed), 1);
    }
}

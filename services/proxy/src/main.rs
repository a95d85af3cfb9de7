//! mesh-proxy binary.
//!
//! Loads the bootstrap file named by `MESH_BOOTSTRAP`, applies its clusters
//! and listeners, and serves until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mesh_proxy::config::{BootstrapConfig, Config};
use mesh_proxy::network::NetworkFilterFactory;
use mesh_proxy::{ClusterManager, Server, TcpProxyFilterFactory};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to MESH_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting mesh-proxy");

    let bootstrap = BootstrapConfig::from_file(&config.bootstrap_path).with_context(|| {
        format!(
            "Failed to load bootstrap file {}",
            config.bootstrap_path.display()
        )
    })?;
    info!(
        bootstrap = %config.bootstrap_path.display(),
        listener_count = bootstrap.listeners.len(),
        cluster_count = bootstrap.clusters.len(),
        "Configuration loaded"
    );
    for (listener, cluster) in bootstrap.dangling_routes() {
        warn!(listener = %listener, cluster = %cluster, "Route references unknown cluster");
    }

    let cluster_manager = Arc::new(ClusterManager::new());
    let mut server =
        Server::new(Arc::clone(&cluster_manager)).with_shutdown_grace(config.shutdown_grace);

    for entry in bootstrap.clusters {
        let name = entry.cluster.name.clone();
        server
            .update_cluster_config(entry.cluster)
            .with_context(|| format!("Invalid cluster {}", name))?;
        server
            .update_cluster_hosts(&name, 0, entry.hosts)
            .with_context(|| format!("Invalid hosts for cluster {}", name))?;
    }

    for entry in bootstrap.listeners {
        let name = entry.listener.name.clone();
        let factory: Arc<dyn NetworkFilterFactory> = Arc::new(TcpProxyFilterFactory::new(
            entry.tcp_proxy,
            Arc::clone(&cluster_manager),
        ));
        let addr = server
            .add_listener(entry.listener, vec![factory])
            .await
            .with_context(|| format!("Failed to add listener {}", name))?;
        if let Some(addr) = addr {
            info!(listener = %name, bind_addr = %addr, "Listener ready");
        }
    }

    server.start();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    server.close().await;
    Ok(())
}

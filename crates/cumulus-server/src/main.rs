//! Main entry point for a Cumulus cluster member.
//!
//! Loads the layered configuration, binds the TCP transport on the LAN
//! address and runs the cluster member until Ctrl+C or SIGTERM.

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use cumulus_core::ClusterManager;
use cumulus_server::{
    Cli, TcpTransport, load_configuration, metrics,
    startup::{self, LoggingConfig},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let configuration = load_configuration(&cli)?;

    let _logging_guard = startup::init_logging(&LoggingConfig::from_configuration(&configuration))?;
    metrics::init_metrics();

    let local = configuration.local_node();
    info!(
        "Starting cumulus-server {} as {} in cluster '{}'",
        env!("CARGO_PKG_VERSION"),
        local,
        local.cluster_name
    );

    let transport = TcpTransport::new();
    let bound = transport.bind(&local.lan_id()).await?;

    let manager = ClusterManager::from_configuration(&configuration, Arc::new(transport.clone()));
    transport.attach(Arc::new(manager.clone()));
    manager.start().await?;

    info!(
        "Cluster member {} listening on {} with {} known nodes",
        manager.local_id(),
        bound,
        manager.nodes().len()
    );

    let shutdown = startup::wait_for_shutdown_signal();
    shutdown.wait().await;

    manager.stop().await;
    transport.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

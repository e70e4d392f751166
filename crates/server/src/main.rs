//! Standalone Tessera shard server.
//!
//! Hosts the shard manager behind the consensus gRPC listener: peers in the
//! same shard groups exchange Raft traffic here, and shards this process
//! has never served come up lazily on the first inbound message. A health
//! monitor probes the configured upstream peer and the node's own shards.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use clap::Parser;
use tonic::transport::Server;
use tracing::info;

use tessera_endorser::HealthMonitor;
use tessera_proto::proto::{
    shard_health_server::ShardHealthServer, shard_raft_server::ShardRaftServer,
};
use tessera_shard::{ShardHealthService, ShardManager, ShardRaftService};
use tessera_types::{ProofSigner, ShardTopology, TesseraConfig};

/// Sharded dependency-tracking shard server.
#[derive(Debug, Parser)]
#[command(name = "tessera-server", version, about)]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(long, env = "TESSERA_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address override (defaults to the resolved self address).
    #[arg(long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => TesseraConfig::load(path)?,
        None => TesseraConfig::default(),
    };
    let topology = match &config.shard_topology_file {
        Some(path) => ShardTopology::load(path)?,
        None => ShardTopology::default(),
    };

    let listen: SocketAddr = match args.listen {
        Some(listen) => listen,
        None => config.resolved_self_address().parse()?,
    };

    let signer = ProofSigner::new(config.resolved_proof_key().into_bytes());
    let manager = ShardManager::new(config.clone(), topology, signer);

    let monitor = HealthMonitor::new(
        manager.clone(),
        config.upstream_peer.clone(),
        config.circuit_breaker.clone(),
    );
    let health_handle = monitor.handle();
    let monitor_task = monitor.start();

    let raft_service = ShardRaftService::new(manager.clone());
    let health_service = ShardHealthService::new(manager.clone());

    info!(%listen, "tessera shard server starting");

    Server::builder()
        .add_service(
            ShardRaftServer::new(raft_service)
                .max_decoding_message_size(config.max_msg_size)
                .max_encoding_message_size(config.max_msg_size),
        )
        .add_service(ShardHealthServer::new(health_service))
        .serve_with_shutdown(listen, shutdown_signal())
        .await?;

    info!("listener stopped, shutting down shards");
    monitor_task.abort();
    shutdown(&manager).await;
    info!(healthy = health_handle.status().is_healthy, "tessera shard server stopped");

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

async fn shutdown(manager: &Arc<ShardManager>) {
    manager.shutdown().await;
}

//! Shard manager: lazy creation and lifecycle of shard replicas.
//!
//! Shards are keyed by namespace and created on first use, either from the
//! endorser fan-out or from an inbound consensus message for a shard this
//! process has not served yet. The replica set for a new shard comes from
//! the topology file; unconfigured shards run as single-replica groups.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::RwLock;
use tracing::{info, warn};

use tessera_types::{ProofSigner, ShardTopology, TesseraConfig};

use crate::{error::ShardError, network::GrpcShardNetworkFactory, replica::ShardReplica};

/// Manager for every shard replica hosted by this process.
pub struct ShardManager {
    config: TesseraConfig,
    topology: ShardTopology,
    self_address: String,
    signer: ProofSigner,
    shards: RwLock<HashMap<String, Arc<ShardReplica>>>,
    /// Serializes replica creation so concurrent `get_or_create` calls for
    /// one shard build exactly one instance.
    create_lock: tokio::sync::Mutex<()>,
    stopped: AtomicBool,
}

impl ShardManager {
    /// Creates a manager; replicas are built lazily.
    pub fn new(config: TesseraConfig, topology: ShardTopology, signer: ProofSigner) -> Arc<Self> {
        let self_address = config.resolved_self_address();
        Arc::new(Self {
            config,
            topology,
            self_address,
            signer,
            shards: RwLock::new(HashMap::new()),
            create_lock: tokio::sync::Mutex::new(()),
            stopped: AtomicBool::new(false),
        })
    }

    /// The address this process answers on.
    pub fn self_address(&self) -> &str {
        &self.self_address
    }

    /// Returns the shard replica, creating it on first use.
    pub async fn get_or_create(&self, shard_id: &str) -> Result<Arc<ShardReplica>, ShardError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(ShardError::ShuttingDown);
        }

        if let Some(shard) = self.shards.read().get(shard_id) {
            return Ok(shard.clone());
        }

        let _guard = self.create_lock.lock().await;

        // Double check: another caller may have created it while this one
        // waited on the creation lock.
        if let Some(shard) = self.shards.read().get(shard_id) {
            return Ok(shard.clone());
        }
        if self.stopped.load(Ordering::Acquire) {
            return Err(ShardError::ShuttingDown);
        }

        let shard_config = self.topology.shard_config(shard_id, &self.self_address);
        let network = GrpcShardNetworkFactory::new(shard_id.to_string());
        let replica = ShardReplica::spawn(
            shard_config.clone(),
            &self.config,
            self.signer.clone(),
            network,
        )
        .await?;

        self.shards.write().insert(shard_id.to_string(), replica.clone());
        info!(
            shard_id,
            replica_id = shard_config.replica_id,
            replicas = shard_config.replica_nodes.len(),
            "created shard"
        );

        Ok(replica)
    }

    /// Returns the shard replica if it already exists.
    pub fn get(&self, shard_id: &str) -> Option<Arc<ShardReplica>> {
        self.shards.read().get(shard_id).cloned()
    }

    /// Ids of every live shard.
    pub fn list_shards(&self) -> Vec<String> {
        self.shards.read().keys().cloned().collect()
    }

    /// Whether `shutdown` has run.
    pub fn is_shut_down(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Requests handled per shard.
    pub fn metrics(&self) -> HashMap<String, u64> {
        self.shards
            .read()
            .iter()
            .map(|(shard_id, shard)| (shard_id.clone(), shard.tracker().requests_handled()))
            .collect()
    }

    /// Live dependency-map size per shard.
    pub fn map_sizes(&self) -> HashMap<String, usize> {
        self.shards
            .read()
            .iter()
            .map(|(shard_id, shard)| (shard_id.clone(), shard.tracker().len()))
            .collect()
    }

    /// Stops every shard. Idempotent; later `get_or_create` calls fail
    /// with `ShuttingDown`.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        let shards: Vec<(String, Arc<ShardReplica>)> =
            self.shards.write().drain().collect();

        for (shard_id, shard) in shards {
            info!(shard_id = %shard_id, "stopping shard");
            shard.stop().await;
        }

        info!("shard manager shut down");
    }
}

impl Drop for ShardManager {
    fn drop(&mut self) {
        if !self.stopped.load(Ordering::Acquire) && !self.shards.read().is_empty() {
            warn!("shard manager dropped without shutdown");
        }
    }
}

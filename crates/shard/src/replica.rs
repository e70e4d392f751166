//! One shard replica: consensus group member, proposer, and apply target.
//!
//! A replica owns its Raft instance, the dependency tracker the apply loop
//! writes into, the batching proposer, and the TTL sweep task. Requests
//! enter through a bounded propose queue and leave as signed proofs on
//! per-request completion channels.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use openraft::{
    BasicNode, Raft,
    error::{ClientWriteError, RaftError},
    network::RaftNetworkFactory,
    storage::Adaptor,
};
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::interval,
};
use tracing::{debug, info, warn};

use tessera_proto::codec::encode_abort;
use tessera_types::{
    AbortEntry, PrepareProof, PrepareRequest, ProofSigner, ReplicaId, ShardConfig, TesseraConfig,
};

use crate::{
    batching::{Batcher, PendingPrepare},
    dependency::DependencyTracker,
    error::ShardError,
    store::MemShardStore,
    types::{LogRecord, ShardResponse, ShardTypeConfig},
};

/// Capacity of the bounded propose queue.
pub const PROPOSE_QUEUE_CAPACITY: usize = 1024;

/// A running shard replica.
pub struct ShardReplica {
    shard_id: String,
    node_id: ReplicaId,
    raft: Arc<Raft<ShardTypeConfig>>,
    tracker: Arc<DependencyTracker>,
    propose_tx: mpsc::Sender<PendingPrepare>,
    shutdown_tx: watch::Sender<bool>,
    batcher_task: Mutex<Option<JoinHandle<()>>>,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
    max_msg_size: usize,
}

impl std::fmt::Debug for ShardReplica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardReplica")
            .field("shard_id", &self.shard_id)
            .field("node_id", &self.node_id)
            .field("stopped", &self.stopped)
            .field("max_msg_size", &self.max_msg_size)
            .finish_non_exhaustive()
    }
}

impl ShardReplica {
    /// Builds and starts a replica for one shard group.
    ///
    /// `network` supplies the consensus transport; production wiring passes
    /// the gRPC factory, tests may pass an in-process one. The replica
    /// bootstraps the group with the configured member set; a bootstrap
    /// race with a peer that already initialized the group is harmless and
    /// logged at debug level.
    pub async fn spawn<NF>(
        shard_config: ShardConfig,
        config: &TesseraConfig,
        signer: ProofSigner,
        network: NF,
    ) -> Result<Arc<Self>, ShardError>
    where
        NF: RaftNetworkFactory<ShardTypeConfig>,
    {
        let shard_id = shard_config.shard_id.clone();
        let node_id = shard_config.replica_id;

        let tracker = Arc::new(DependencyTracker::new(
            shard_id.clone(),
            config.expiry_duration,
            signer,
        ));
        let store = MemShardStore::new(tracker.clone(), config.max_msg_size);

        let raft_config = openraft::Config {
            cluster_name: format!("tessera-shard-{shard_id}"),
            heartbeat_interval: config.heartbeat_interval().as_millis() as u64,
            election_timeout_min: config.election_timeout_min().as_millis() as u64,
            election_timeout_max: config.election_timeout_max().as_millis() as u64,
            max_payload_entries: config.max_inflight_msgs,
            ..Default::default()
        };

        let (log_store, state_machine) = Adaptor::new(store);

        let raft = Raft::<ShardTypeConfig>::new(
            node_id,
            Arc::new(raft_config),
            network,
            log_store,
            state_machine,
        )
        .await
        .map_err(|e| ShardError::Proposal {
            message: format!("failed to create consensus group: {e}"),
        })?;
        let raft = Arc::new(raft);

        let members: BTreeMap<ReplicaId, BasicNode> = shard_config
            .members()
            .into_iter()
            .map(|(id, addr)| (id, BasicNode { addr }))
            .collect();
        if let Err(e) = raft.initialize(members).await {
            // Another replica (or an earlier incarnation) won the bootstrap.
            debug!(shard_id = %shard_id, error = %e, "bootstrap skipped");
        }

        let (propose_tx, propose_rx) = mpsc::channel(PROPOSE_QUEUE_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let batcher = Batcher::new(
            shard_id.clone(),
            node_id,
            raft.clone(),
            propose_rx,
            shutdown_rx,
            config.batch_timeout,
            config.batch_max_size,
            config.max_msg_size,
        );
        let batcher_handle = tokio::spawn(batcher.run());

        let sweep_handle = {
            let tracker = tracker.clone();
            let sweep_interval = config.sweep_interval;
            tokio::spawn(async move {
                let mut ticker = interval(sweep_interval);
                ticker.tick().await; // the first tick fires immediately
                loop {
                    ticker.tick().await;
                    tracker.sweep_expired();
                }
            })
        };

        info!(
            shard_id = %shard_id,
            replica_id = node_id,
            replicas = shard_config.replica_nodes.len(),
            "shard replica started"
        );

        Ok(Arc::new(Self {
            shard_id,
            node_id,
            raft,
            tracker,
            propose_tx,
            shutdown_tx,
            batcher_task: Mutex::new(Some(batcher_handle)),
            sweep_task: Mutex::new(Some(sweep_handle)),
            stopped: AtomicBool::new(false),
            max_msg_size: config.max_msg_size,
        }))
    }

    /// The shard this replica serves.
    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    /// This replica's id within the group.
    pub fn replica_id(&self) -> ReplicaId {
        self.node_id
    }

    /// The consensus handle, for the inbound transport service.
    pub fn raft(&self) -> &Arc<Raft<ShardTypeConfig>> {
        &self.raft
    }

    /// The dependency tracker, for metrics and tests.
    pub fn tracker(&self) -> &Arc<DependencyTracker> {
        &self.tracker
    }

    /// Whether this replica currently leads the group.
    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.node_id)
    }

    /// The leader this replica currently believes in.
    pub fn current_leader(&self) -> Option<ReplicaId> {
        self.raft.metrics().borrow().current_leader
    }

    /// Queues a prepare request.
    ///
    /// Returns a receiver that resolves with the signed proof once the
    /// containing batch commits and applies. Fails fast with `NotLeader`
    /// when another replica is known to lead, and with `Busy` when the
    /// propose queue is full; neither blocks. The request must name at
    /// least one read or written key; only the coordinator's primary probe
    /// ([`propose_probe`](Self::propose_probe)) may arrive empty.
    pub fn propose(
        &self,
        request: PrepareRequest,
    ) -> Result<oneshot::Receiver<Result<PrepareProof, ShardError>>, ShardError> {
        self.queue(request, false)
    }

    /// Queues the coordinator's primary-namespace probe.
    ///
    /// The invoked contract is consulted even when simulation touched none
    /// of its keys, so a probe may carry an empty footprint. Every other
    /// invariant of [`propose`](Self::propose) still applies.
    pub fn propose_probe(
        &self,
        request: PrepareRequest,
    ) -> Result<oneshot::Receiver<Result<PrepareProof, ShardError>>, ShardError> {
        self.queue(request, true)
    }

    fn queue(
        &self,
        request: PrepareRequest,
        allow_empty: bool,
    ) -> Result<oneshot::Receiver<Result<PrepareProof, ShardError>>, ShardError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(ShardError::ShuttingDown);
        }

        request
            .validate(&self.shard_id, allow_empty)
            .map_err(|source| ShardError::InvalidRequest { source })?;

        if let Some(leader) = self.current_leader()
            && leader != self.node_id
        {
            return Err(ShardError::NotLeader { leader: Some(leader) });
        }

        let (responder, receiver) = oneshot::channel();
        let item = PendingPrepare {
            request,
            responder,
            queued_at: tokio::time::Instant::now(),
        };

        self.propose_tx.try_send(item).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => ShardError::Busy,
            mpsc::error::TrySendError::Closed(_) => ShardError::ShuttingDown,
        })?;

        Ok(receiver)
    }

    /// Proposes an abort for `tx_id`, releasing its map entries on apply.
    ///
    /// Leader-only: aborts are advisory cleanups and are not held for
    /// leadership changes the way prepare batches are.
    pub async fn abort(&self, tx_id: &str) -> Result<usize, ShardError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(ShardError::ShuttingDown);
        }
        if !self.is_leader() {
            return Err(ShardError::NotLeader { leader: self.current_leader() });
        }

        let abort = AbortEntry { tx_id: tx_id.to_string(), timestamp_nanos: now_nanos() };
        let data = encode_abort(&abort);
        if data.len() > self.max_msg_size {
            return Err(ShardError::Proposal {
                message: "encoded abort exceeds the message size bound".to_string(),
            });
        }

        match self.raft.client_write(LogRecord::new(data)).await {
            Ok(response) => match response.data {
                ShardResponse::Aborted { removed } => {
                    debug!(shard_id = %self.shard_id, tx_id, removed, "abort applied");
                    Ok(removed)
                },
                other => Err(ShardError::Proposal {
                    message: format!("unexpected apply response for abort: {other:?}"),
                }),
            },
            Err(RaftError::APIError(ClientWriteError::ForwardToLeader(forward))) => {
                Err(ShardError::NotLeader { leader: forward.leader_id })
            },
            Err(err) => Err(ShardError::Proposal { message: err.to_string() }),
        }
    }

    /// Stops the replica: drains the batcher, stops background tasks, and
    /// shuts the consensus group down. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        let _ = self.shutdown_tx.send(true);

        // The batcher exits through the shutdown signal, failing every
        // still-pending request with `ShuttingDown`; wait for that drain.
        let batcher = self.batcher_task.lock().take();
        if let Some(batcher) = batcher
            && batcher.await.is_err()
        {
            warn!(shard_id = %self.shard_id, "batcher task ended abnormally");
        }
        let sweep = self.sweep_task.lock().take();
        if let Some(sweep) = sweep {
            sweep.abort();
        }

        if let Err(e) = self.raft.shutdown().await {
            warn!(shard_id = %self.shard_id, error = ?e, "error during consensus shutdown");
        }

        info!(shard_id = %self.shard_id, "shard replica stopped");
    }
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

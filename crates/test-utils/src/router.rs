//! In-process consensus transport for multi-replica tests.
//!
//! Routes Raft RPCs directly into the target replica's consensus instance.
//! Disconnecting a replica makes every RPC to it fail as unreachable, which
//! is how tests simulate a crashed node.

use std::{collections::HashMap, future::Future, sync::Arc};

use openraft::{
    BasicNode, Raft, Snapshot, Vote,
    error::{Fatal, RPCError, RaftError, ReplicationClosed, StreamingError, Unreachable},
    network::{RPCOption, RaftNetwork, RaftNetworkFactory},
    raft::{
        AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
        InstallSnapshotResponse, SnapshotResponse, VoteRequest, VoteResponse,
    },
};
use parking_lot::RwLock;
use tessera_shard::types::ShardTypeConfig;
use tessera_types::ReplicaId;

/// Error used for unreachable or unregistered replicas.
#[derive(Debug)]
struct RouteError(String);

impl std::fmt::Display for RouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "route error: {}", self.0)
    }
}

impl std::error::Error for RouteError {}

/// Shared routing table between in-process replicas.
#[derive(Clone, Default)]
pub struct LocalRouter {
    targets: Arc<RwLock<HashMap<ReplicaId, Arc<Raft<ShardTypeConfig>>>>>,
}

impl LocalRouter {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a replica's consensus handle under its id.
    pub fn register(&self, id: ReplicaId, raft: Arc<Raft<ShardTypeConfig>>) {
        self.targets.write().insert(id, raft);
    }

    /// Makes a replica unreachable, simulating a crash.
    pub fn disconnect(&self, id: ReplicaId) {
        self.targets.write().remove(&id);
    }

    /// A network factory bound to this router.
    pub fn factory(&self) -> LocalRouterFactory {
        LocalRouterFactory { router: self.clone() }
    }

    fn get(&self, id: ReplicaId) -> Option<Arc<Raft<ShardTypeConfig>>> {
        self.targets.read().get(&id).cloned()
    }
}

/// Factory producing in-process connections.
pub struct LocalRouterFactory {
    router: LocalRouter,
}

impl RaftNetworkFactory<ShardTypeConfig> for LocalRouterFactory {
    type Network = LocalRouterConnection;

    async fn new_client(&mut self, target: ReplicaId, _node: &BasicNode) -> Self::Network {
        LocalRouterConnection { target, router: self.router.clone() }
    }
}

/// A connection to one in-process replica.
pub struct LocalRouterConnection {
    target: ReplicaId,
    router: LocalRouter,
}

impl LocalRouterConnection {
    fn target_raft<E>(
        &self,
    ) -> Result<Arc<Raft<ShardTypeConfig>>, RPCError<ReplicaId, BasicNode, E>>
    where
        E: std::error::Error,
    {
        self.router.get(self.target).ok_or_else(|| {
            RPCError::Unreachable(Unreachable::new(&RouteError(format!(
                "replica {} is disconnected",
                self.target
            ))))
        })
    }
}

impl RaftNetwork<ShardTypeConfig> for LocalRouterConnection {
    async fn vote(
        &mut self,
        rpc: VoteRequest<ReplicaId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<ReplicaId>, RPCError<ReplicaId, BasicNode, RaftError<ReplicaId>>>
    {
        let raft = self.target_raft()?;
        raft.vote(rpc)
            .await
            .map_err(|e| RPCError::Unreachable(Unreachable::new(&e)))
    }

    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<ShardTypeConfig>,
        _option: RPCOption,
    ) -> Result<
        AppendEntriesResponse<ReplicaId>,
        RPCError<ReplicaId, BasicNode, RaftError<ReplicaId>>,
    > {
        let raft = self.target_raft()?;
        raft.append_entries(rpc)
            .await
            .map_err(|e| RPCError::Unreachable(Unreachable::new(&e)))
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<ShardTypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<ReplicaId>,
        RPCError<
            ReplicaId,
            BasicNode,
            RaftError<ReplicaId, openraft::error::InstallSnapshotError>,
        >,
    > {
        let raft = self.target_raft()?;
        raft.install_snapshot(rpc)
            .await
            .map_err(|e| RPCError::Unreachable(Unreachable::new(&e)))
    }

    async fn full_snapshot(
        &mut self,
        vote: Vote<ReplicaId>,
        snapshot: Snapshot<ShardTypeConfig>,
        cancel: impl Future<Output = ReplicationClosed> + Send + 'static,
        option: RPCOption,
    ) -> Result<SnapshotResponse<ReplicaId>, StreamingError<ShardTypeConfig, Fatal<ReplicaId>>>
    {
        use openraft::network::snapshot_transport::{Chunked, SnapshotTransport};

        Chunked::send_snapshot(self, vote, snapshot, cancel, option).await
    }
}

//! Consensus transport between the replicas of one shard, over gRPC.
//!
//! Connections are lazy: one cached channel per peer, dialed on first send
//! with a 5 s connect timeout and a 2 s per-message timeout. A send failure
//! surfaces as `Unreachable`, which makes openraft back off and retransmit;
//! the replica state machine itself never blocks on a dead peer. Per-peer
//! ordering is best-effort FIFO over HTTP/2; consensus tolerates loss and
//! reordering.

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use openraft::{
    BasicNode, Snapshot, Vote,
    error::{Fatal, RPCError, RaftError, ReplicationClosed, StreamingError, Unreachable},
    network::{RPCOption, RaftNetwork, RaftNetworkFactory},
    raft::{
        AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
        InstallSnapshotResponse, SnapshotResponse, VoteRequest, VoteResponse,
    },
};
use parking_lot::RwLock;
use tonic::transport::{Channel, Endpoint};

use tessera_proto::{
    convert::{log_id_from_proto, log_id_to_proto},
    proto::{self, shard_raft_client::ShardRaftClient},
};
use tessera_types::ReplicaId;

use crate::types::ShardTypeConfig;

/// Peer dial timeout.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-message send timeout.
const SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Error type for network operations.
#[derive(Debug, Clone)]
pub struct NetworkError(String);

impl std::fmt::Display for NetworkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NetworkError: {}", self.0)
    }
}

impl std::error::Error for NetworkError {}

/// gRPC transport shared by every connection of one shard group.
#[derive(Clone)]
pub struct GrpcShardNetwork {
    shard_id: String,
    /// Cached gRPC clients for peer replicas.
    clients: Arc<RwLock<HashMap<ReplicaId, ShardRaftClient<Channel>>>>,
}

impl GrpcShardNetwork {
    fn new(shard_id: String) -> Self {
        Self { shard_id, clients: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Returns or creates a client connection to a peer replica.
    async fn get_client(
        &self,
        target: ReplicaId,
        node: &BasicNode,
    ) -> Result<ShardRaftClient<Channel>, NetworkError> {
        if let Some(client) = self.clients.read().get(&target).cloned() {
            return Ok(client);
        }

        let endpoint = Endpoint::from_shared(format!("http://{}", node.addr))
            .map_err(|e| NetworkError(format!("invalid endpoint: {e}")))?
            .connect_timeout(DIAL_TIMEOUT)
            .timeout(SEND_TIMEOUT);
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| NetworkError(format!("connection failed: {e}")))?;

        let client = ShardRaftClient::new(channel);
        self.clients.write().insert(target, client.clone());
        Ok(client)
    }

    /// Drops the cached channel so the next send re-dials.
    fn evict(&self, target: ReplicaId) {
        self.clients.write().remove(&target);
    }
}

/// Factory producing connections for one shard group.
pub struct GrpcShardNetworkFactory {
    network: GrpcShardNetwork,
}

impl GrpcShardNetworkFactory {
    /// Creates the factory for `shard_id`.
    pub fn new(shard_id: String) -> Self {
        Self { network: GrpcShardNetwork::new(shard_id) }
    }
}

impl RaftNetworkFactory<ShardTypeConfig> for GrpcShardNetworkFactory {
    type Network = GrpcShardNetworkConnection;

    async fn new_client(&mut self, target: ReplicaId, node: &BasicNode) -> Self::Network {
        GrpcShardNetworkConnection {
            target,
            node: node.clone(),
            network: self.network.clone(),
        }
    }
}

/// A connection to one peer replica of the shard group.
pub struct GrpcShardNetworkConnection {
    target: ReplicaId,
    node: BasicNode,
    network: GrpcShardNetwork,
}

impl GrpcShardNetworkConnection {
    fn unreachable<E: std::error::Error + 'static>(&self, err: &E) -> Unreachable {
        self.network.evict(self.target);
        Unreachable::new(err)
    }
}

impl RaftNetwork<ShardTypeConfig> for GrpcShardNetworkConnection {
    async fn vote(
        &mut self,
        rpc: VoteRequest<ReplicaId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<ReplicaId>, RPCError<ReplicaId, BasicNode, RaftError<ReplicaId>>>
    {
        let mut client = self
            .network
            .get_client(self.target, &self.node)
            .await
            .map_err(|e| RPCError::Unreachable(self.unreachable(&e)))?;

        let request = proto::RaftVoteRequest {
            shard_id: self.network.shard_id.clone(),
            vote: Some((&rpc.vote).into()),
            last_log_id: rpc.last_log_id.as_ref().map(log_id_to_proto),
        };

        let response = client
            .vote(request)
            .await
            .map_err(|e| {
                RPCError::Unreachable(self.unreachable(&NetworkError(e.to_string())))
            })?
            .into_inner();

        let vote = response.vote.ok_or_else(|| {
            RPCError::Unreachable(
                self.unreachable(&NetworkError("missing vote in response".to_string())),
            )
        })?;

        let voter = vote.node_id;
        Ok(VoteResponse {
            vote: (&vote).into(),
            vote_granted: response.vote_granted,
            last_log_id: response.last_log_id.map(|id| log_id_from_proto(&id, voter)),
        })
    }

    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<ShardTypeConfig>,
        _option: RPCOption,
    ) -> Result<
        AppendEntriesResponse<ReplicaId>,
        RPCError<ReplicaId, BasicNode, RaftError<ReplicaId>>,
    > {
        let mut client = self
            .network
            .get_client(self.target, &self.node)
            .await
            .map_err(|e| RPCError::Unreachable(self.unreachable(&e)))?;

        let entries: Vec<Vec<u8>> = rpc
            .entries
            .iter()
            .map(|entry| tessera_types::encode_payload("raft entry", entry).unwrap_or_default())
            .collect();

        let request = proto::RaftAppendEntriesRequest {
            shard_id: self.network.shard_id.clone(),
            vote: Some((&rpc.vote).into()),
            prev_log_id: rpc.prev_log_id.as_ref().map(log_id_to_proto),
            entries,
            leader_commit: rpc.leader_commit.as_ref().map(log_id_to_proto),
        };

        let response = client
            .append_entries(request)
            .await
            .map_err(|e| {
                RPCError::Unreachable(self.unreachable(&NetworkError(e.to_string())))
            })?
            .into_inner();

        if response.success {
            Ok(AppendEntriesResponse::Success)
        } else if response.conflict {
            Ok(AppendEntriesResponse::Conflict)
        } else if let Some(vote) = response.vote {
            Ok(AppendEntriesResponse::HigherVote((&vote).into()))
        } else {
            Ok(AppendEntriesResponse::Conflict)
        }
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
        let mut client = self
            .network
            .get_client(self.target, &self.node)
            .await
            .map_err(|e| RPCError::Unreachable(self.unreachable(&e)))?;

        let members: HashMap<u64, String> = rpc
            .meta
            .last_membership
            .nodes()
            .map(|(id, node)| (*id, node.addr.clone()))
            .collect();

        let request = proto::RaftInstallSnapshotRequest {
            shard_id: self.network.shard_id.clone(),
            vote: Some((&rpc.vote).into()),
            meta: Some(proto::RaftSnapshotMeta {
                last_log_id: rpc.meta.last_log_id.as_ref().map(log_id_to_proto),
                last_membership: Some(proto::RaftMembership {
                    configs: vec![proto::RaftMembershipConfig { members }],
                }),
                snapshot_id: rpc.meta.snapshot_id.clone(),
            }),
            offset: rpc.offset,
            data: rpc.data.clone(),
            done: rpc.done,
        };

        let response = client
            .install_snapshot(request)
            .await
            .map_err(|e| {
                RPCError::Unreachable(self.unreachable(&NetworkError(e.to_string())))
            })?
            .into_inner();

        let vote = response.vote.ok_or_else(|| {
            RPCError::Unreachable(
                self.unreachable(&NetworkError("missing vote in response".to_string())),
            )
        })?;

        Ok(InstallSnapshotResponse { vote: (&vote).into() })
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

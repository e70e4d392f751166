//! Inbound gRPC services: consensus message delivery and node health.
//!
//! One listener serves every shard group hosted by this process; each RPC
//! names its shard and is stepped into that shard's consensus instance.
//! Delivery for a shard this process has not served yet lazily creates the
//! replica from the configured topology, so followers come up on the first
//! message from a bootstrapping leader.

use std::sync::Arc;

use openraft::{BasicNode, Vote, raft::AppendEntriesRequest};
use tonic::{Request, Response, Status};

use tessera_proto::{
    convert::{log_id_from_proto, log_id_to_proto},
    proto::{
        HealthCheckRequest, HealthCheckResponse, RaftAppendEntriesRequest,
        RaftAppendEntriesResponse, RaftInstallSnapshotRequest, RaftInstallSnapshotResponse,
        RaftVoteRequest, RaftVoteResponse,
        shard_health_server::ShardHealth,
        shard_raft_server::ShardRaft,
    },
};
use tessera_types::ReplicaId;

use crate::{manager::ShardManager, replica::ShardReplica, types::ShardTypeConfig};

/// Consensus message delivery for every shard hosted by this process.
pub struct ShardRaftService {
    manager: Arc<ShardManager>,
}

impl ShardRaftService {
    /// Creates the service over the shard manager.
    pub fn new(manager: Arc<ShardManager>) -> Self {
        Self { manager }
    }

    async fn resolve(&self, shard_id: &str) -> Result<Arc<ShardReplica>, Status> {
        if shard_id.is_empty() {
            return Err(Status::invalid_argument("missing shard_id"));
        }
        self.manager
            .get_or_create(shard_id)
            .await
            .map_err(|e| Status::unavailable(format!("shard {shard_id} unavailable: {e}")))
    }
}

#[tonic::async_trait]
impl ShardRaft for ShardRaftService {
    async fn vote(
        &self,
        request: Request<RaftVoteRequest>,
    ) -> Result<Response<RaftVoteResponse>, Status> {
        let req = request.into_inner();
        let shard = self.resolve(&req.shard_id).await?;

        let vote = req.vote.as_ref().ok_or_else(|| Status::invalid_argument("missing vote"))?;
        let raft_vote: Vote<ReplicaId> = vote.into();
        let candidate = vote.node_id;
        let last_log_id = req.last_log_id.map(|id| log_id_from_proto(&id, candidate));

        let response = shard
            .raft()
            .vote(openraft::raft::VoteRequest { vote: raft_vote, last_log_id })
            .await
            .map_err(|e| Status::internal(format!("vote failed: {e}")))?;

        Ok(Response::new(RaftVoteResponse {
            vote: Some((&response.vote).into()),
            vote_granted: response.vote_granted,
            last_log_id: response.last_log_id.as_ref().map(log_id_to_proto),
        }))
    }

    async fn append_entries(
        &self,
        request: Request<RaftAppendEntriesRequest>,
    ) -> Result<Response<RaftAppendEntriesResponse>, Status> {
        let req = request.into_inner();
        let shard = self.resolve(&req.shard_id).await?;

        let vote = req.vote.as_ref().ok_or_else(|| Status::invalid_argument("missing vote"))?;
        let leader = vote.node_id;

        // Entries that fail to decode are dropped here; the leader observes
        // the missing acknowledgement and retransmits.
        let entries: Vec<openraft::Entry<ShardTypeConfig>> = req
            .entries
            .iter()
            .filter_map(|bytes| tessera_types::decode_payload("raft entry", bytes).ok())
            .collect();

        let append_request = AppendEntriesRequest {
            vote: vote.into(),
            prev_log_id: req.prev_log_id.map(|id| log_id_from_proto(&id, leader)),
            entries,
            leader_commit: req.leader_commit.map(|id| log_id_from_proto(&id, leader)),
        };

        let response = shard
            .raft()
            .append_entries(append_request)
            .await
            .map_err(|e| Status::internal(format!("append entries failed: {e}")))?;

        use openraft::raft::AppendEntriesResponse::*;
        let (success, conflict, higher_vote) = match response {
            Success => (true, false, None),
            Conflict => (false, true, None),
            HigherVote(v) => (false, false, Some((&v).into())),
            PartialSuccess(_) => (true, false, None),
        };

        Ok(Response::new(RaftAppendEntriesResponse {
            success,
            conflict,
            vote: higher_vote,
        }))
    }

    async fn install_snapshot(
        &self,
        request: Request<RaftInstallSnapshotRequest>,
    ) -> Result<Response<RaftInstallSnapshotResponse>, Status> {
        let req = request.into_inner();
        let shard = self.resolve(&req.shard_id).await?;

        let vote = req.vote.as_ref().ok_or_else(|| Status::invalid_argument("missing vote"))?;
        let leader = vote.node_id;
        let meta =
            req.meta.as_ref().ok_or_else(|| Status::invalid_argument("missing meta"))?;

        let last_log_id = meta.last_log_id.as_ref().map(|id| log_id_from_proto(id, leader));

        let membership_proto = meta
            .last_membership
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("missing last_membership"))?;

        use std::collections::{BTreeMap, BTreeSet};
        let mut nodes: BTreeMap<u64, BasicNode> = BTreeMap::new();
        for config in &membership_proto.configs {
            for (node_id, addr) in &config.members {
                nodes.insert(*node_id, BasicNode { addr: addr.clone() });
            }
        }
        let voter_ids: BTreeSet<u64> = nodes.keys().copied().collect();
        let membership = openraft::Membership::new(vec![voter_ids], nodes);

        let snapshot_meta = openraft::SnapshotMeta {
            last_log_id,
            last_membership: openraft::StoredMembership::new(last_log_id, membership),
            snapshot_id: meta.snapshot_id.clone(),
        };

        let install_request = openraft::raft::InstallSnapshotRequest {
            vote: vote.into(),
            meta: snapshot_meta,
            offset: req.offset,
            data: req.data,
            done: req.done,
        };

        let response = shard
            .raft()
            .install_snapshot(install_request)
            .await
            .map_err(|e| Status::internal(format!("install snapshot failed: {e}")))?;

        Ok(Response::new(RaftInstallSnapshotResponse {
            vote: Some((&response.vote).into()),
        }))
    }
}

/// Node-level health over gRPC.
///
/// Reports per-shard dependency-map sizes; unhealthy once the manager has
/// shut down.
pub struct ShardHealthService {
    manager: Arc<ShardManager>,
}

impl ShardHealthService {
    /// Creates the service over the shard manager.
    pub fn new(manager: Arc<ShardManager>) -> Self {
        Self { manager }
    }
}

#[tonic::async_trait]
impl ShardHealth for ShardHealthService {
    async fn check(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let healthy = !self.manager.is_shut_down();
        let mut details: std::collections::HashMap<String, String> = self
            .manager
            .map_sizes()
            .into_iter()
            .map(|(shard_id, size)| (format!("shard.{shard_id}.map_size"), size.to_string()))
            .collect();
        details.insert("shards".to_string(), self.manager.list_shards().len().to_string());

        Ok(Response::new(HealthCheckResponse { healthy, details }))
    }
}

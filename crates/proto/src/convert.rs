//! Bidirectional conversions between domain and protobuf types.

use tessera_types::{AbortEntry, PrepareBatch, PrepareProof, PrepareRequest, ReplicaId};

use crate::proto;

// ============================================================================
// Prepare types
// ============================================================================

impl From<&PrepareRequest> for proto::PrepareRequest {
    fn from(req: &PrepareRequest) -> Self {
        // BTreeMap iteration is key-ordered, which makes the encoding
        // canonical: identical sets always produce identical bytes.
        Self {
            tx_id: req.tx_id.clone(),
            shard_id: req.shard_id.clone(),
            read_set: req
                .read_set
                .iter()
                .map(|(key, value)| proto::KeyValue { key: key.clone(), value: value.clone() })
                .collect(),
            write_set: req
                .write_set
                .iter()
                .map(|(key, value)| proto::KeyValue { key: key.clone(), value: value.clone() })
                .collect(),
            timestamp_nanos: req.timestamp_nanos,
        }
    }
}

impl From<proto::PrepareRequest> for PrepareRequest {
    fn from(req: proto::PrepareRequest) -> Self {
        Self {
            tx_id: req.tx_id,
            shard_id: req.shard_id,
            read_set: req.read_set.into_iter().map(|kv| (kv.key, kv.value)).collect(),
            write_set: req.write_set.into_iter().map(|kv| (kv.key, kv.value)).collect(),
            timestamp_nanos: req.timestamp_nanos,
        }
    }
}

impl From<&PrepareBatch> for proto::PrepareBatch {
    fn from(batch: &PrepareBatch) -> Self {
        Self { requests: batch.requests.iter().map(Into::into).collect() }
    }
}

impl From<proto::PrepareBatch> for PrepareBatch {
    fn from(batch: proto::PrepareBatch) -> Self {
        Self { requests: batch.requests.into_iter().map(Into::into).collect() }
    }
}

impl From<&AbortEntry> for proto::AbortEntry {
    fn from(abort: &AbortEntry) -> Self {
        Self { tx_id: abort.tx_id.clone(), timestamp_nanos: abort.timestamp_nanos }
    }
}

impl From<proto::AbortEntry> for AbortEntry {
    fn from(abort: proto::AbortEntry) -> Self {
        Self { tx_id: abort.tx_id, timestamp_nanos: abort.timestamp_nanos }
    }
}

impl From<&PrepareProof> for proto::PrepareProof {
    fn from(proof: &PrepareProof) -> Self {
        Self {
            tx_id: proof.tx_id.clone(),
            shard_id: proof.shard_id.clone(),
            commit_index: proof.commit_index,
            leader_id: proof.leader_id,
            signature: proof.signature.clone(),
            term: proof.term,
            dependent_tx_id: proof.dependent_tx_id.clone(),
        }
    }
}

impl From<proto::PrepareProof> for PrepareProof {
    fn from(proof: proto::PrepareProof) -> Self {
        Self {
            tx_id: proof.tx_id,
            shard_id: proof.shard_id,
            commit_index: proof.commit_index,
            leader_id: proof.leader_id,
            term: proof.term,
            signature: proof.signature,
            dependent_tx_id: proof.dependent_tx_id,
        }
    }
}

// ============================================================================
// Consensus plumbing
// ============================================================================

impl From<&openraft::Vote<ReplicaId>> for proto::RaftVote {
    fn from(vote: &openraft::Vote<ReplicaId>) -> Self {
        Self {
            term: vote.leader_id.term,
            node_id: vote.leader_id.node_id,
            committed: vote.committed,
        }
    }
}

impl From<&proto::RaftVote> for openraft::Vote<ReplicaId> {
    fn from(vote: &proto::RaftVote) -> Self {
        if vote.committed {
            openraft::Vote::new_committed(vote.term, vote.node_id)
        } else {
            openraft::Vote::new(vote.term, vote.node_id)
        }
    }
}

/// Converts an openraft log id to its proto representation.
pub fn log_id_to_proto(id: &openraft::LogId<ReplicaId>) -> proto::RaftLogId {
    proto::RaftLogId { term: id.leader_id.term, index: id.index }
}

/// Rebuilds an openraft log id, attributing the entry to `leader_node_id`.
pub fn log_id_from_proto(
    id: &proto::RaftLogId,
    leader_node_id: ReplicaId,
) -> openraft::LogId<ReplicaId> {
    openraft::LogId::new(openraft::CommittedLeaderId::new(id.term, leader_node_id), id.index)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn test_prepare_request_roundtrip() {
        let req = PrepareRequest {
            tx_id: "tx1".to_string(),
            shard_id: "alpha".to_string(),
            read_set: BTreeMap::from([("r1".to_string(), b"a".to_vec())]),
            write_set: BTreeMap::from([
                ("w1".to_string(), b"b".to_vec()),
                ("w2".to_string(), b"c".to_vec()),
            ]),
            timestamp_nanos: 42,
        };

        let wire: proto::PrepareRequest = (&req).into();
        let back: PrepareRequest = wire.into();
        assert_eq!(req, back);
    }

    #[test]
    fn test_vote_roundtrip() {
        let vote = openraft::Vote::<ReplicaId>::new_committed(7, 2);
        let wire: proto::RaftVote = (&vote).into();
        assert_eq!(wire.term, 7);
        assert_eq!(wire.node_id, 2);
        assert!(wire.committed);

        let back: openraft::Vote<ReplicaId> = (&wire).into();
        assert_eq!(back, vote);
    }

    #[test]
    fn test_log_id_roundtrip() {
        let id = openraft::LogId::new(openraft::CommittedLeaderId::new(3, 1), 11);
        let wire = log_id_to_proto(&id);
        let back = log_id_from_proto(&wire, 1);
        assert_eq!(back, id);
    }
}

//! Core types for the per-shard consensus group.
//!
//! Defines the openraft type configuration: the application data carried in
//! each log entry and the response produced when an entry is applied.

use std::io::Cursor;

use openraft::{BasicNode, impls::OneshotResponder};
use serde::{Deserialize, Serialize};
use tessera_types::{PrepareProof, ReplicaId};

// Type parameters:
// - `D`: application data (opaque canonical record bytes)
// - `R`: application response (proofs / abort result)
// - `NodeId`: replica id within the shard group
// - `Node`: node metadata (BasicNode with address info)
// - `SnapshotData`: in-memory cursor (log and map are not persisted)
// - `AsyncRuntime`: tokio
openraft::declare_raft_types!(
    /// Shard group Raft type configuration.
    pub ShardTypeConfig:
        D = LogRecord,
        R = ShardResponse,
        NodeId = ReplicaId,
        Node = BasicNode,
        Entry = openraft::Entry<ShardTypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = openraft::TokioRuntime,
        Responder = OneshotResponder<ShardTypeConfig>
);

/// One replicated-log entry payload.
///
/// The bytes are the canonical codec form of either a prepare batch or an
/// abort record. They stay opaque until apply so that a malformed record is
/// a per-entry skip, never a replica crash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Canonical record bytes (`tessera_proto::codec`).
    pub data: Vec<u8>,
}

impl LogRecord {
    /// Wraps encoded record bytes.
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

/// Response from applying one log entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardResponse {
    /// Blank or membership entry.
    #[default]
    Empty,

    /// A prepare batch was applied; one proof per request, in request order.
    Prepared {
        /// Proofs in the order the requests appeared in the batch.
        proofs: Vec<PrepareProof>,
    },

    /// An abort was applied.
    Aborted {
        /// Number of dependency entries released.
        removed: usize,
    },

    /// The record could not be decoded and was skipped.
    Rejected {
        /// Decode failure description.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_record_roundtrip() {
        let record = LogRecord::new(vec![1, 2, 3]);
        let bytes = tessera_types::encode_payload("raft entry", &record).expect("encode");
        let back: LogRecord =
            tessera_types::decode_payload("raft entry", &bytes).expect("decode");
        assert_eq!(back, record);
    }

    #[test]
    fn test_response_default_is_empty() {
        assert_eq!(ShardResponse::default(), ShardResponse::Empty);
    }
}

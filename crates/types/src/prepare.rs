//! Prepare requests, abort records, and prepare proofs.
//!
//! A [`PrepareRequest`] carries the read/write footprint of one simulated
//! transaction into a shard. The shard orders the request through its
//! replicated log and answers with a [`PrepareProof`] naming the log
//! position at which the request was applied.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// Errors raised when validating an incoming prepare request.
#[derive(Debug, Clone, Snafu)]
pub enum RequestError {
    /// Both the read set and the write set are empty.
    #[snafu(display("prepare request {tx_id} has an empty footprint"))]
    EmptyFootprint {
        /// The offending transaction id.
        tx_id: String,
    },

    /// The request was routed to a shard it does not name.
    #[snafu(display("prepare request targets shard {requested}, received by shard {receiver}"))]
    ShardMismatch {
        /// Shard named in the request.
        requested: String,
        /// Shard that received it.
        receiver: String,
    },
}

/// One in-flight dependency query.
///
/// Read and write sets are ordered maps so that every replica iterates the
/// footprint in the same order during apply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareRequest {
    /// Opaque transaction identifier, unique per submission.
    pub tx_id: String,
    /// Namespace this request belongs to.
    pub shard_id: String,
    /// Keys the transaction would read, with observed values.
    pub read_set: BTreeMap<String, Vec<u8>>,
    /// Keys the transaction would overwrite, with new values.
    pub write_set: BTreeMap<String, Vec<u8>>,
    /// Send time in nanoseconds since the Unix epoch.
    pub timestamp_nanos: i64,
}

impl PrepareRequest {
    /// Checks the request invariants against the receiving shard.
    ///
    /// An empty footprint is tolerated only when `allow_empty` is set,
    /// which the shard's probe entry point does for the coordinator's
    /// primary-namespace probes; any other request must name at least one
    /// key.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::EmptyFootprint`] for an empty footprint and
    /// [`RequestError::ShardMismatch`] when the request names a shard
    /// other than `receiver`.
    pub fn validate(&self, receiver: &str, allow_empty: bool) -> Result<(), RequestError> {
        if !allow_empty && self.read_set.is_empty() && self.write_set.is_empty() {
            return Err(RequestError::EmptyFootprint { tx_id: self.tx_id.clone() });
        }
        if self.shard_id != receiver {
            return Err(RequestError::ShardMismatch {
                requested: self.shard_id.clone(),
                receiver: receiver.to_string(),
            });
        }
        Ok(())
    }
}

/// An ordered group of prepare requests proposed as one log record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareBatch {
    /// Requests in arrival order.
    pub requests: Vec<PrepareRequest>,
}

/// A transaction abort carried through the replicated log.
///
/// Applying an abort removes every dependency-map entry whose last writer
/// is the aborted transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortEntry {
    /// Transaction being aborted.
    pub tx_id: String,
    /// Abort time in nanoseconds since the Unix epoch.
    pub timestamp_nanos: i64,
}

/// Signed receipt for an applied prepare request.
///
/// `commit_index` and `term` name the log position at which the apply loop
/// observed the request; the signature is a keyed MAC over
/// `shard_id || commit_index || tx_id` so any holder of the shared key can
/// verify the proof offline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareProof {
    /// Transaction the proof answers.
    pub tx_id: String,
    /// Shard that applied the request.
    pub shard_id: String,
    /// Log index of the batch containing the request.
    pub commit_index: u64,
    /// Replica id of the leader that committed the entry.
    pub leader_id: u64,
    /// Consensus term at `commit_index`.
    pub term: u64,
    /// Keyed MAC over the proof tuple.
    pub signature: Vec<u8>,
    /// Most recent conflicting writer observed for this request, if any.
    pub dependent_tx_id: String,
}

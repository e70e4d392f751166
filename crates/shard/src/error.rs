//! Error types for shard operations.
//!
//! Openraft's error types carry complex generic bounds that do not compose
//! with snafu's derive, so consensus failures are captured as messages while
//! the semantic cases (leadership, backpressure, shutdown) keep dedicated
//! variants.

use snafu::Snafu;
use tessera_types::{ReplicaId, RequestError};

/// Errors surfaced by a shard replica or the shard manager.
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ShardError {
    /// A propose or abort reached a replica that is not the leader.
    #[snafu(display("not the shard leader (known leader: {leader:?})"))]
    NotLeader {
        /// The leader this replica currently believes in, if any.
        leader: Option<ReplicaId>,
    },

    /// The propose queue is full.
    #[snafu(display("propose queue is full"))]
    Busy,

    /// The caller's deadline expired before a proof arrived.
    #[snafu(display("deadline expired before a proof was received"))]
    Timeout,

    /// The shard (or the whole manager) has been shut down.
    #[snafu(display("shard is shutting down"))]
    ShuttingDown,

    /// The request failed validation before it was queued.
    #[snafu(display("invalid prepare request: {source}"))]
    InvalidRequest {
        /// The violated request invariant.
        source: RequestError,
    },

    /// A consensus proposal failed for a non-leadership reason.
    #[snafu(display("consensus proposal failed: {message}"))]
    Proposal {
        /// Description of the consensus failure.
        message: String,
    },
}

//! Error types for the endorser-side coordinator.

use snafu::Snafu;
use tessera_shard::ShardError;

/// Why one shard failed to deliver a verified proof.
#[derive(Debug, Clone, Snafu)]
pub enum PrepareFailure {
    /// The shard could not be obtained from the manager.
    #[snafu(display("shard unavailable: {source}"))]
    Unavailable {
        /// The manager error.
        source: ShardError,
    },

    /// The prepare request could not be queued (`Busy`, `NotLeader`, ...).
    #[snafu(display("propose failed: {source}"))]
    Propose {
        /// The replica error.
        source: ShardError,
    },

    /// No proof arrived before the shared deadline.
    #[snafu(display("no proof before the deadline"))]
    ProofTimeout,

    /// The shard answered, but the proof failed shape or MAC verification.
    #[snafu(display("proof failed verification"))]
    InvalidProof,
}

/// One shard's failure within a transaction fan-out.
#[derive(Debug, Clone)]
pub struct ShardFailureDetail {
    /// Shard that failed.
    pub shard_id: String,
    /// What went wrong.
    pub failure: PrepareFailure,
}

impl std::fmt::Display for ShardFailureDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.shard_id, self.failure)
    }
}

/// Errors surfaced by the coordinator.
#[derive(Debug, Snafu)]
pub enum CoordinatorError {
    /// One or more shards failed; every contacted shard received an abort
    /// broadcast and no proof is surfaced to the caller.
    #[snafu(display("failed to gather dependency proofs for {tx_id}: {}", format_failures(failures)))]
    ShardFailure {
        /// The failed transaction.
        tx_id: String,
        /// Per-shard failures.
        failures: Vec<ShardFailureDetail>,
    },
}

fn format_failures(failures: &[ShardFailureDetail]) -> String {
    failures.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

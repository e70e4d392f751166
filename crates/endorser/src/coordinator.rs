//! Endorser-side prepare coordinator.
//!
//! For each endorsed transaction the coordinator extracts the involved
//! namespaces from the simulation result, fans one prepare request out to
//! every involved shard under a single shared deadline, verifies the
//! returned proofs, and aggregates them into the dependency metadata that
//! rides on the endorsement response. Any partial failure aborts the
//! transaction on every contacted shard and surfaces no proof at all.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::time::Instant;
use tracing::{debug, info, warn};

use tessera_shard::{ShardError, ShardManager, ShardReplica};
use tessera_types::{PrepareProof, PrepareRequest, ProofSigner};

use crate::{
    error::{CoordinatorError, PrepareFailure, ShardFailureDetail},
    simulation::{Footprint, SimulationResult, group_by_namespace, is_system_namespace},
};

/// Bound on each abort broadcast after a failed fan-out.
const ABORT_TIMEOUT: Duration = Duration::from_secs(1);

/// Aggregated dependency metadata for one endorsed transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyOutcome {
    /// Whether any proof landed past the first position of its shard's log,
    /// meaning the shard already held earlier observations.
    pub has_dependency: bool,
    /// The conflicting writer reported by the most advanced shard, if any.
    pub dependent_tx_id: String,
    /// Highest commit index across the collected proofs.
    pub max_commit_index: u64,
    /// Consensus term at that highest commit index.
    pub term_at_max: u64,
}

impl DependencyOutcome {
    /// The textual trailer appended to the endorsement response message.
    pub fn trailer(&self) -> String {
        format!(
            "DependencyInfo:HasDependency={},DependentTxID={},ShardCommitIndex={},ProofTerm={}",
            self.has_dependency, self.dependent_tx_id, self.max_commit_index, self.term_at_max
        )
    }
}

/// Per-transaction prepare fan-out over the shard manager.
pub struct EndorsementCoordinator {
    manager: Arc<ShardManager>,
    verifier: ProofSigner,
    prepare_timeout: Duration,
}

impl EndorsementCoordinator {
    /// Creates a coordinator verifying proofs with `verifier`.
    pub fn new(
        manager: Arc<ShardManager>,
        verifier: ProofSigner,
        prepare_timeout: Duration,
    ) -> Self {
        Self { manager, verifier, prepare_timeout }
    }

    /// Runs the prepare fan-out for one simulated transaction.
    ///
    /// The primary namespace (the invoked contract) is always consulted,
    /// even when the simulation touched none of its keys; cross-contract
    /// writes pull their namespaces in through the simulation result.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::ShardFailure`] when any involved shard
    /// fails to produce a verified proof within the shared deadline; by
    /// then every contacted shard has received an abort for the
    /// transaction.
    pub async fn prepare_transaction(
        &self,
        simulation: &SimulationResult,
        primary_namespace: &str,
    ) -> Result<DependencyOutcome, CoordinatorError> {
        let tx_id = simulation.tx_id.clone();
        let mut involved = group_by_namespace(simulation);
        if !primary_namespace.is_empty() && !is_system_namespace(primary_namespace) {
            involved.entry(primary_namespace.to_string()).or_default();
        }

        debug!(
            tx_id = %tx_id,
            shards = involved.len(),
            "starting prepare fan-out"
        );

        let deadline = Instant::now() + self.prepare_timeout;
        let mut failures: Vec<ShardFailureDetail> = Vec::new();
        let mut contacted: Vec<Arc<ShardReplica>> = Vec::new();
        let mut waiting = Vec::new();

        // Scatter: obtain every involved shard and queue one request each.
        // Failures are collected, not short-circuited, so the abort
        // broadcast below reaches everything that was contacted.
        for (shard_id, footprint) in involved {
            let shard = match self.manager.get_or_create(&shard_id).await {
                Ok(shard) => shard,
                Err(source) => {
                    failures.push(ShardFailureDetail {
                        shard_id,
                        failure: PrepareFailure::Unavailable { source },
                    });
                    continue;
                },
            };
            contacted.push(shard.clone());

            // Only the primary namespace may be consulted with an empty
            // footprint; everything else must name at least one key.
            let is_primary_probe = footprint.is_empty() && shard_id == primary_namespace;
            let request = prepare_request(&tx_id, &shard_id, footprint);
            let queued = if is_primary_probe {
                shard.propose_probe(request)
            } else {
                shard.propose(request)
            };

            match queued {
                Ok(receiver) => waiting.push((shard_id, receiver)),
                Err(source) => {
                    failures.push(ShardFailureDetail {
                        shard_id,
                        failure: PrepareFailure::Propose { source },
                    });
                },
            }
        }

        // Gather: wait for every queued proof under the shared deadline.
        let gathered = futures::future::join_all(waiting.into_iter().map(
            |(shard_id, receiver)| async move {
                let result = match tokio::time::timeout_at(deadline, receiver).await {
                    Err(_elapsed) => Err(PrepareFailure::ProofTimeout),
                    Ok(Err(_closed)) => Err(PrepareFailure::Propose {
                        source: ShardError::ShuttingDown,
                    }),
                    Ok(Ok(Err(source))) => Err(PrepareFailure::Propose { source }),
                    Ok(Ok(Ok(proof))) => Ok(proof),
                };
                (shard_id, result)
            },
        ))
        .await;

        let mut proofs: Vec<PrepareProof> = Vec::new();
        for (shard_id, result) in gathered {
            match result {
                Ok(proof) => {
                    if self.verify_proof(&proof, &tx_id, &shard_id) {
                        proofs.push(proof);
                    } else {
                        warn!(tx_id = %tx_id, shard_id = %shard_id, "proof failed verification");
                        failures.push(ShardFailureDetail {
                            shard_id,
                            failure: PrepareFailure::InvalidProof,
                        });
                    }
                },
                Err(failure) => failures.push(ShardFailureDetail { shard_id, failure }),
            }
        }

        if !failures.is_empty() {
            warn!(
                tx_id = %tx_id,
                failures = failures.len(),
                "prepare fan-out failed, aborting on contacted shards"
            );
            self.abort_all(&contacted, &tx_id).await;
            return Err(CoordinatorError::ShardFailure { tx_id, failures });
        }

        let outcome = aggregate(&proofs);
        info!(
            tx_id = %tx_id,
            has_dependency = outcome.has_dependency,
            commit_index = outcome.max_commit_index,
            "prepare fan-out complete"
        );
        Ok(outcome)
    }

    /// Full verification: shape, binding to this transaction and shard,
    /// and the MAC tag.
    fn verify_proof(&self, proof: &PrepareProof, tx_id: &str, shard_id: &str) -> bool {
        proof.tx_id == tx_id && proof.shard_id == shard_id && self.verifier.verify(proof)
    }

    /// Best-effort abort broadcast to every contacted shard.
    async fn abort_all(&self, contacted: &[Arc<ShardReplica>], tx_id: &str) {
        let broadcasts = contacted.iter().map(|shard| async move {
            match tokio::time::timeout(ABORT_TIMEOUT, shard.abort(tx_id)).await {
                Ok(Ok(removed)) => {
                    debug!(shard_id = %shard.shard_id(), tx_id, removed, "abort delivered");
                },
                Ok(Err(err)) => {
                    warn!(shard_id = %shard.shard_id(), tx_id, error = %err, "abort failed");
                },
                Err(_elapsed) => {
                    warn!(shard_id = %shard.shard_id(), tx_id, "abort timed out");
                },
            }
        });
        futures::future::join_all(broadcasts).await;
    }
}

fn prepare_request(tx_id: &str, shard_id: &str, footprint: Footprint) -> PrepareRequest {
    PrepareRequest {
        tx_id: tx_id.to_string(),
        shard_id: shard_id.to_string(),
        read_set: footprint.reads,
        write_set: footprint.writes,
        timestamp_nanos: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0),
    }
}

/// Folds the verified proofs into the response metadata.
///
/// A transaction is flagged as dependent when any of its proofs committed
/// past the first position of its shard's log; `dependent_tx_id` comes from
/// the proof at the highest commit index, falling back to any proof that
/// named a conflicting writer.
fn aggregate(proofs: &[PrepareProof]) -> DependencyOutcome {
    let mut outcome = DependencyOutcome::default();
    for proof in proofs {
        if proof.commit_index > 1 {
            outcome.has_dependency = true;
        }
        if proof.commit_index > outcome.max_commit_index {
            outcome.max_commit_index = proof.commit_index;
            outcome.term_at_max = proof.term;
            outcome.dependent_tx_id = proof.dependent_tx_id.clone();
        }
    }
    if outcome.dependent_tx_id.is_empty()
        && let Some(proof) = proofs.iter().find(|p| !p.dependent_tx_id.is_empty())
    {
        outcome.dependent_tx_id = proof.dependent_tx_id.clone();
    }
    outcome
}

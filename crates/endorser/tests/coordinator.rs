//! End-to-end tests for the endorser-side prepare fan-out.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tessera_endorser::{
    CoordinatorError, EndorsementCoordinator, NamespaceReadWriteSet, PrepareFailure,
    SimulationResult,
};
use tessera_shard::{ShardError, ShardManager};
use tessera_test_utils::assert_eventually;
use tessera_types::{PrepareRequest, ProofSigner, ShardTopology, TesseraConfig};

const PROOF_KEY: &[u8] = b"coordinator-test-key";

fn test_config() -> TesseraConfig {
    TesseraConfig::builder()
        .batch_timeout(Duration::from_millis(20))
        .batch_max_size(8)
        .prepare_timeout(Duration::from_secs(2))
        .election_tick(3)
        .heartbeat_tick(1)
        .build()
}

fn manager_with_topology(topology: ShardTopology) -> Arc<ShardManager> {
    ShardManager::new(test_config(), topology, ProofSigner::new(PROOF_KEY.to_vec()))
}

fn coordinator(manager: &Arc<ShardManager>) -> EndorsementCoordinator {
    EndorsementCoordinator::new(
        manager.clone(),
        ProofSigner::new(PROOF_KEY.to_vec()),
        test_config().prepare_timeout,
    )
}

/// Creates the shard and waits until it leads its (single-replica) group.
async fn warm_shard(manager: &Arc<ShardManager>, shard_id: &str) {
    let shard = manager.get_or_create(shard_id).await.expect("create shard");
    assert!(
        assert_eventually(Duration::from_secs(10), || shard.is_leader()).await,
        "shard {shard_id} should elect itself"
    );
}

fn simulation(tx_id: &str, sets: Vec<NamespaceReadWriteSet>) -> SimulationResult {
    SimulationResult { tx_id: tx_id.to_string(), sets }
}

#[tokio::test]
async fn test_single_namespace_prepare() {
    let manager = manager_with_topology(ShardTopology::default());
    warm_shard(&manager, "fabcar").await;
    let coordinator = coordinator(&manager);

    let outcome = coordinator
        .prepare_transaction(
            &simulation(
                "tx1",
                vec![NamespaceReadWriteSet::public("fabcar").write("car1", b"red".to_vec())],
            ),
            "fabcar",
        )
        .await
        .expect("prepare");

    assert!(outcome.max_commit_index >= 1);
    assert!(outcome.dependent_tx_id.is_empty());
    assert!(outcome.trailer().starts_with("DependencyInfo:HasDependency="));
    assert!(outcome
        .trailer()
        .contains(&format!("ShardCommitIndex={}", outcome.max_commit_index)));

    // The write landed under its qualified key.
    let shard = manager.get("fabcar").expect("shard");
    assert_eq!(
        shard.tracker().get("fabcar:car1").expect("entry").last_writer_tx_id,
        "tx1"
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn test_second_transaction_sees_dependency() {
    let manager = manager_with_topology(ShardTopology::default());
    warm_shard(&manager, "fabcar").await;
    let coordinator = coordinator(&manager);

    coordinator
        .prepare_transaction(
            &simulation(
                "tx1",
                vec![NamespaceReadWriteSet::public("fabcar").write("car1", b"red".to_vec())],
            ),
            "fabcar",
        )
        .await
        .expect("prepare tx1");

    let outcome = coordinator
        .prepare_transaction(
            &simulation(
                "tx2",
                vec![NamespaceReadWriteSet::public("fabcar").read("car1", Some((1, 0)))],
            ),
            "fabcar",
        )
        .await
        .expect("prepare tx2");

    // The shard's log is past its first position, so the aggregate flags a
    // dependency and names the conflicting writer.
    assert!(outcome.has_dependency);
    assert!(outcome.max_commit_index > 1);
    assert_eq!(outcome.dependent_tx_id, "tx1");
    assert!(outcome.trailer().contains("HasDependency=true"));
    assert!(outcome.trailer().contains("DependentTxID=tx1"));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_primary_namespace_always_consulted() {
    let manager = manager_with_topology(ShardTopology::default());
    warm_shard(&manager, "fabcar").await;
    let coordinator = coordinator(&manager);

    // Read-only simulation with no tracked keys at all.
    let outcome = coordinator
        .prepare_transaction(&simulation("tx1", Vec::new()), "fabcar")
        .await
        .expect("prepare");

    assert!(outcome.max_commit_index >= 1, "primary shard must still be consulted");
    assert!(outcome.dependent_tx_id.is_empty());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_multi_namespace_fan_out() {
    let manager = manager_with_topology(ShardTopology::default());
    warm_shard(&manager, "fabcar").await;
    warm_shard(&manager, "marbles").await;
    let coordinator = coordinator(&manager);

    let outcome = coordinator
        .prepare_transaction(
            &simulation(
                "tx1",
                vec![
                    NamespaceReadWriteSet::public("fabcar").write("car1", b"red".to_vec()),
                    NamespaceReadWriteSet::public("marbles").write("m1", b"blue".to_vec()),
                ],
            ),
            "fabcar",
        )
        .await
        .expect("prepare");

    assert!(outcome.max_commit_index >= 1);
    assert_eq!(
        manager.get("fabcar").expect("shard").tracker().get("fabcar:car1").expect("entry")
            .last_writer_tx_id,
        "tx1"
    );
    assert_eq!(
        manager
            .get("marbles")
            .expect("shard")
            .tracker()
            .get("marbles:m1")
            .expect("entry")
            .last_writer_tx_id,
        "tx1"
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn test_partial_failure_aborts_everywhere() {
    // "stuck" is a three-replica group whose peers do not exist: it never
    // elects a leader, so its propose queue can be saturated.
    let topology = ShardTopology::from_map(HashMap::from([(
        "stuck".to_string(),
        vec![
            "198.51.100.1:7251".to_string(),
            "198.51.100.2:7251".to_string(),
            "198.51.100.3:7251".to_string(),
        ],
    )]));
    let manager = manager_with_topology(topology);
    warm_shard(&manager, "fabcar").await;
    let coordinator = coordinator(&manager);

    // Saturate the stuck shard's propose queue.
    let stuck = manager.get_or_create("stuck").await.expect("create stuck shard");
    let mut saturated = false;
    let mut parked = Vec::new();
    for i in 0..4096 {
        match stuck.propose(PrepareRequest {
            tx_id: format!("filler-{i}"),
            shard_id: "stuck".to_string(),
            read_set: Default::default(),
            write_set: [(format!("f{i}"), b"v".to_vec())].into_iter().collect(),
            timestamp_nanos: 0,
        }) {
            Ok(rx) => parked.push(rx),
            Err(ShardError::Busy) => {
                saturated = true;
                break;
            },
            Err(other) => panic!("unexpected propose error: {other}"),
        }
    }
    assert!(saturated, "stuck shard queue should saturate");

    let result = coordinator
        .prepare_transaction(
            &simulation(
                "tx1",
                vec![
                    NamespaceReadWriteSet::public("fabcar").write("car1", b"red".to_vec()),
                    NamespaceReadWriteSet::public("stuck").write("s1", b"x".to_vec()),
                ],
            ),
            "fabcar",
        )
        .await;

    let CoordinatorError::ShardFailure { tx_id, failures } = result.expect_err("must fail");
    assert_eq!(tx_id, "tx1");
    assert!(failures.iter().any(|detail| detail.shard_id == "stuck"
        && matches!(
            &detail.failure,
            PrepareFailure::Propose { source: ShardError::Busy }
        )));

    // The healthy shard received the abort: no surviving entry names tx1.
    let fabcar = manager.get("fabcar").expect("shard");
    let released = assert_eventually(Duration::from_secs(5), move || {
        fabcar
            .tracker()
            .get("fabcar:car1")
            .is_none_or(|entry| entry.last_writer_tx_id != "tx1")
    })
    .await;
    assert!(released, "abort should release tx1's reservation on the healthy shard");

    manager.shutdown().await;
}

#[tokio::test]
async fn test_empty_non_primary_footprint_fails_the_fan_out() {
    let manager = manager_with_topology(ShardTopology::default());
    warm_shard(&manager, "fabcar").await;
    warm_shard(&manager, "marbles").await;
    let coordinator = coordinator(&manager);

    // Only the primary may be consulted with an empty footprint; a bare
    // secondary namespace violates the request invariant.
    let result = coordinator
        .prepare_transaction(
            &simulation(
                "tx1",
                vec![
                    NamespaceReadWriteSet::public("fabcar").write("car1", b"red".to_vec()),
                    NamespaceReadWriteSet::public("marbles"),
                ],
            ),
            "fabcar",
        )
        .await;

    let CoordinatorError::ShardFailure { failures, .. } = result.expect_err("must fail");
    assert!(failures.iter().any(|detail| detail.shard_id == "marbles"
        && matches!(
            &detail.failure,
            PrepareFailure::Propose { source: ShardError::InvalidRequest { .. } }
        )));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_system_namespace_skipped() {
    let manager = manager_with_topology(ShardTopology::default());
    warm_shard(&manager, "fabcar").await;
    let coordinator = coordinator(&manager);

    coordinator
        .prepare_transaction(
            &simulation(
                "tx1",
                vec![
                    NamespaceReadWriteSet::public("fabcar").write("car1", b"red".to_vec()),
                    NamespaceReadWriteSet::public("lscc").read("fabcar", None),
                ],
            ),
            "fabcar",
        )
        .await
        .expect("prepare");

    assert!(manager.get("lscc").is_none(), "system namespace must not get a shard");

    manager.shutdown().await;
}

//! Leader failover across a three-replica shard group.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use tessera_shard::ShardReplica;
use tessera_test_utils::{LocalRouter, assert_eventually};
use tessera_types::{PrepareRequest, ProofSigner, ShardConfig, TesseraConfig};

fn test_config() -> TesseraConfig {
    TesseraConfig::builder()
        .batch_timeout(Duration::from_millis(20))
        .batch_max_size(8)
        .election_tick(3)
        .heartbeat_tick(1)
        .build()
}

fn write_request(tx_id: &str, key: &str, value: &[u8]) -> PrepareRequest {
    PrepareRequest {
        tx_id: tx_id.to_string(),
        shard_id: "alpha".to_string(),
        read_set: BTreeMap::new(),
        write_set: BTreeMap::from([(key.to_string(), value.to_vec())]),
        timestamp_nanos: 0,
    }
}

async fn spawn_group(router: &LocalRouter) -> Vec<Arc<ShardReplica>> {
    let nodes: Vec<String> = (1..=3).map(|i| format!("node-{i}")).collect();
    let mut replicas = Vec::new();
    for id in 1..=3u64 {
        let shard_config = ShardConfig {
            shard_id: "alpha".to_string(),
            replica_nodes: nodes.clone(),
            replica_id: id,
        };
        let replica = ShardReplica::spawn(
            shard_config,
            &test_config(),
            ProofSigner::new(b"failover-test-key".to_vec()),
            router.factory(),
        )
        .await
        .expect("spawn replica");
        router.register(id, replica.raft().clone());
        replicas.push(replica);
    }
    replicas
}

fn leader_of(replicas: &[Arc<ShardReplica>]) -> Option<Arc<ShardReplica>> {
    replicas.iter().find(|replica| replica.is_leader()).cloned()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_new_leader_serves_after_failover() {
    let router = LocalRouter::new();
    let replicas = spawn_group(&router).await;

    assert!(
        assert_eventually(Duration::from_secs(20), || leader_of(&replicas).is_some()).await,
        "group should elect a leader"
    );
    let leader = leader_of(&replicas).expect("leader");
    let leader_id = leader.replica_id();

    // Commit one write through the first leader.
    let rx = leader.propose(write_request("tx1", "k1", b"v1")).expect("propose");
    let first = rx.await.expect("channel").expect("proof");
    let first_term = first.term;

    // Every live replica applies the same entry.
    for replica in &replicas {
        let tracker = replica.tracker().clone();
        assert!(
            assert_eventually(Duration::from_secs(10), move || {
                tracker.get("k1").is_some_and(|entry| entry.last_writer_tx_id == "tx1")
            })
            .await,
            "replica {} should apply the committed write",
            replica.replica_id()
        );
    }

    // Kill the leader.
    router.disconnect(leader_id);
    leader.stop().await;

    let survivors: Vec<Arc<ShardReplica>> = replicas
        .iter()
        .filter(|replica| replica.replica_id() != leader_id)
        .cloned()
        .collect();

    assert!(
        assert_eventually(Duration::from_secs(20), || {
            survivors
                .iter()
                .any(|replica| replica.is_leader() && replica.replica_id() != leader_id)
        })
        .await,
        "survivors should elect a new leader"
    );
    let new_leader = survivors
        .iter()
        .find(|replica| replica.is_leader())
        .cloned()
        .expect("new leader");

    // A conflicting write against the new leader succeeds with a later term.
    let rx = new_leader.propose(write_request("tx2", "k1", b"v2")).expect("propose");
    let second = rx.await.expect("channel").expect("proof");

    assert!(second.term > first_term, "term did not advance: {} -> {}", first_term, second.term);
    assert_eq!(second.dependent_tx_id, "tx1");
    assert!(second.commit_index > first.commit_index);

    for replica in survivors {
        replica.stop().await;
    }
}

//! Shard manager lifecycle tests.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use tessera_shard::{ShardError, ShardManager};
use tessera_test_utils::assert_eventually;
use tessera_types::{PrepareRequest, ProofSigner, ShardTopology, TesseraConfig};

fn test_config() -> TesseraConfig {
    TesseraConfig::builder()
        .batch_timeout(Duration::from_millis(20))
        .election_tick(3)
        .heartbeat_tick(1)
        .build()
}

fn manager() -> Arc<ShardManager> {
    ShardManager::new(
        test_config(),
        ShardTopology::default(),
        ProofSigner::new(b"manager-test-key".to_vec()),
    )
}

#[tokio::test]
async fn test_get_or_create_returns_same_instance() {
    let manager = manager();

    let first = manager.get_or_create("alpha").await.expect("create");
    let second = manager.get_or_create("alpha").await.expect("get");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(manager.list_shards(), vec!["alpha".to_string()]);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_get_or_create_builds_one_shard() {
    let manager = manager();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.get_or_create("alpha").await.expect("create") })
        })
        .collect();

    let mut replicas = Vec::new();
    for handle in handles {
        replicas.push(handle.await.expect("join"));
    }

    for replica in &replicas[1..] {
        assert!(Arc::ptr_eq(&replicas[0], replica));
    }
    assert_eq!(manager.list_shards().len(), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_distinct_shards_are_isolated() {
    let manager = manager();

    let alpha = manager.get_or_create("alpha").await.expect("alpha");
    let beta = manager.get_or_create("beta").await.expect("beta");
    assert!(!Arc::ptr_eq(&alpha, &beta));

    assert!(assert_eventually(Duration::from_secs(10), || alpha.is_leader()).await);
    let rx = alpha
        .propose(PrepareRequest {
            tx_id: "tx1".to_string(),
            shard_id: "alpha".to_string(),
            read_set: BTreeMap::new(),
            write_set: BTreeMap::from([("k1".to_string(), b"v1".to_vec())]),
            timestamp_nanos: 0,
        })
        .expect("propose");
    rx.await.expect("channel").expect("proof");

    let metrics = manager.metrics();
    assert_eq!(metrics["alpha"], 1);
    assert_eq!(metrics["beta"], 0);

    let sizes = manager.map_sizes();
    assert_eq!(sizes["alpha"], 1);
    assert_eq!(sizes["beta"], 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_is_idempotent_and_final() {
    let manager = manager();
    manager.get_or_create("alpha").await.expect("create");

    manager.shutdown().await;
    manager.shutdown().await;

    assert!(manager.is_shut_down());
    assert!(manager.list_shards().is_empty());

    let err = manager.get_or_create("beta").await.expect_err("after shutdown");
    assert!(matches!(err, ShardError::ShuttingDown));
}

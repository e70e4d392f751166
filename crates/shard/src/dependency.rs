//! Per-shard dependency map and conflict detection.
//!
//! The tracker maps each key to the transaction that last wrote it within
//! the TTL window. Applying a prepare request records read-after-write and
//! write-after-write conflicts against those entries and produces the
//! signed proof for the request. All mutation happens on the apply path, so
//! iteration order (ordered key sets, batch order, log order) is identical
//! on every replica.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime},
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tessera_types::{PrepareProof, PrepareRequest, ProofSigner};
use tracing::{debug, info};

/// Per-key record of the most recent writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEntry {
    /// Value the writer would commit.
    pub value: Vec<u8>,
    /// Transaction that last wrote the key.
    pub last_writer_tx_id: String,
    /// When this entry stops being considered for conflicts.
    pub expires_at: SystemTime,
    /// Whether the writing request itself carried a dependency.
    pub has_dependency: bool,
}

/// Conflict tracker for one shard.
pub struct DependencyTracker {
    shard_id: String,
    ttl: Duration,
    signer: ProofSigner,
    map: RwLock<HashMap<String, DependencyEntry>>,
    requests_handled: AtomicU64,
    bad_entries: AtomicU64,
    expired_removed: AtomicU64,
}

impl DependencyTracker {
    /// Creates a tracker for `shard_id` with the given entry TTL.
    pub fn new(shard_id: impl Into<String>, ttl: Duration, signer: ProofSigner) -> Self {
        Self {
            shard_id: shard_id.into(),
            ttl,
            signer,
            map: RwLock::new(HashMap::new()),
            requests_handled: AtomicU64::new(0),
            bad_entries: AtomicU64::new(0),
            expired_removed: AtomicU64::new(0),
        }
    }

    /// The shard this tracker belongs to.
    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    /// Applies one prepare request at the given log position.
    ///
    /// The write set is processed after the read set so a self-write does
    /// not shadow the read-conflict check. The returned proof is fully
    /// deterministic: it depends only on the request, the log position, and
    /// the map state produced by earlier applies.
    pub fn check_and_update(
        &self,
        request: &PrepareRequest,
        commit_index: u64,
        term: u64,
        leader_id: u64,
    ) -> PrepareProof {
        let now = SystemTime::now();
        let mut has_dependency = false;
        let mut dependent_tx_id = String::new();

        let mut map = self.map.write();

        for key in request.read_set.keys() {
            if let Some(entry) = map.get(key)
                && entry.last_writer_tx_id != request.tx_id
            {
                has_dependency = true;
                dependent_tx_id = entry.last_writer_tx_id.clone();
                debug!(
                    shard_id = %self.shard_id,
                    tx_id = %request.tx_id,
                    key = %key,
                    writer = %entry.last_writer_tx_id,
                    "read-after-write dependency"
                );
            }
        }

        for (key, value) in &request.write_set {
            if let Some(entry) = map.get(key)
                && entry.last_writer_tx_id != request.tx_id
            {
                has_dependency = true;
                dependent_tx_id = entry.last_writer_tx_id.clone();
                debug!(
                    shard_id = %self.shard_id,
                    tx_id = %request.tx_id,
                    key = %key,
                    writer = %entry.last_writer_tx_id,
                    "write-after-write dependency"
                );
            }
            map.insert(
                key.clone(),
                DependencyEntry {
                    value: value.clone(),
                    last_writer_tx_id: request.tx_id.clone(),
                    expires_at: now + self.ttl,
                    has_dependency,
                },
            );
        }

        drop(map);
        self.requests_handled.fetch_add(1, Ordering::Relaxed);

        PrepareProof {
            tx_id: request.tx_id.clone(),
            shard_id: self.shard_id.clone(),
            commit_index,
            leader_id,
            term,
            signature: self.signer.sign(&self.shard_id, commit_index, &request.tx_id),
            dependent_tx_id,
        }
    }

    /// Removes every entry whose last writer is `tx_id`.
    ///
    /// Applied when an abort commits; returns the number of released keys.
    pub fn remove_writer(&self, tx_id: &str) -> usize {
        let mut map = self.map.write();
        let before = map.len();
        map.retain(|_, entry| entry.last_writer_tx_id != tx_id);
        let removed = before - map.len();
        if removed > 0 {
            info!(shard_id = %self.shard_id, tx_id, removed, "released aborted writer");
        }
        removed
    }

    /// Removes entries whose TTL has elapsed.
    ///
    /// Victims are collected under the read lock; the write lock is taken
    /// only for the deletion pass, which re-checks expiry so an entry
    /// refreshed in between survives.
    pub fn sweep_expired(&self) -> usize {
        let now = SystemTime::now();

        let victims: Vec<String> = {
            let map = self.map.read();
            map.iter()
                .filter(|(_, entry)| entry.expires_at <= now)
                .map(|(key, _)| key.clone())
                .collect()
        };

        if victims.is_empty() {
            return 0;
        }

        let mut removed = 0;
        {
            let mut map = self.map.write();
            for key in victims {
                if map.get(&key).is_some_and(|entry| entry.expires_at <= now) {
                    map.remove(&key);
                    removed += 1;
                }
            }
        }

        self.expired_removed.fetch_add(removed as u64, Ordering::Relaxed);
        info!(shard_id = %self.shard_id, removed, size = self.len(), "dependency sweep");
        removed
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Looks up the entry for a key, if present.
    pub fn get(&self, key: &str) -> Option<DependencyEntry> {
        self.map.read().get(key).cloned()
    }

    /// Total prepare requests applied.
    pub fn requests_handled(&self) -> u64 {
        self.requests_handled.load(Ordering::Relaxed)
    }

    /// Count of log records skipped as malformed.
    pub fn bad_entries(&self) -> u64 {
        self.bad_entries.load(Ordering::Relaxed)
    }

    /// Records one malformed log record.
    pub fn record_bad_entry(&self) {
        self.bad_entries.fetch_add(1, Ordering::Relaxed);
    }

    /// Total entries removed by the TTL sweep.
    pub fn expired_removed(&self) -> u64 {
        self.expired_removed.load(Ordering::Relaxed)
    }

    /// Clones the map content for a snapshot.
    pub fn export_entries(&self) -> Vec<(String, DependencyEntry)> {
        self.map.read().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Replaces the map content from a snapshot.
    pub fn import_entries(&self, entries: Vec<(String, DependencyEntry)>) {
        let mut map = self.map.write();
        map.clear();
        map.extend(entries);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn tracker(ttl: Duration) -> DependencyTracker {
        DependencyTracker::new("alpha", ttl, ProofSigner::new(b"test-key".to_vec()))
    }

    fn write_req(tx_id: &str, key: &str, value: &[u8]) -> PrepareRequest {
        PrepareRequest {
            tx_id: tx_id.to_string(),
            shard_id: "alpha".to_string(),
            read_set: BTreeMap::new(),
            write_set: BTreeMap::from([(key.to_string(), value.to_vec())]),
            timestamp_nanos: 0,
        }
    }

    fn read_req(tx_id: &str, key: &str) -> PrepareRequest {
        PrepareRequest {
            tx_id: tx_id.to_string(),
            shard_id: "alpha".to_string(),
            read_set: BTreeMap::from([(key.to_string(), Vec::new())]),
            write_set: BTreeMap::new(),
            timestamp_nanos: 0,
        }
    }

    #[test]
    fn test_first_write_has_no_dependency() {
        let tracker = tracker(Duration::from_secs(300));
        let proof = tracker.check_and_update(&write_req("tx1", "k1", b"v1"), 1, 1, 1);

        assert!(proof.dependent_tx_id.is_empty());
        assert_eq!(proof.commit_index, 1);

        let entry = tracker.get("k1").expect("entry");
        assert_eq!(entry.value, b"v1");
        assert_eq!(entry.last_writer_tx_id, "tx1");
        assert!(!entry.has_dependency);
    }

    #[test]
    fn test_read_after_write_detected() {
        let tracker = tracker(Duration::from_secs(300));
        tracker.check_and_update(&write_req("tx1", "k1", b"v1"), 1, 1, 1);

        let proof = tracker.check_and_update(&read_req("tx2", "k1"), 2, 1, 1);
        assert_eq!(proof.dependent_tx_id, "tx1");

        // A pure read does not take over the key.
        let entry = tracker.get("k1").expect("entry");
        assert_eq!(entry.last_writer_tx_id, "tx1");
    }

    #[test]
    fn test_write_after_write_overwrites() {
        let tracker = tracker(Duration::from_secs(300));
        tracker.check_and_update(&write_req("tx1", "k1", b"v1"), 1, 1, 1);

        let proof = tracker.check_and_update(&write_req("tx3", "k1", b"v2"), 2, 1, 1);
        assert_eq!(proof.dependent_tx_id, "tx1");

        let entry = tracker.get("k1").expect("entry");
        assert_eq!(entry.value, b"v2");
        assert_eq!(entry.last_writer_tx_id, "tx3");
        assert!(entry.has_dependency);
    }

    #[test]
    fn test_self_write_does_not_shadow_read_check() {
        let tracker = tracker(Duration::from_secs(300));
        tracker.check_and_update(&write_req("tx1", "k1", b"v1"), 1, 1, 1);

        // tx2 both reads and writes k1: the read conflict against tx1 must
        // be seen even though tx2's own write lands on the same key.
        let req = PrepareRequest {
            tx_id: "tx2".to_string(),
            shard_id: "alpha".to_string(),
            read_set: BTreeMap::from([("k1".to_string(), Vec::new())]),
            write_set: BTreeMap::from([("k1".to_string(), b"v2".to_vec())]),
            timestamp_nanos: 0,
        };
        let proof = tracker.check_and_update(&req, 2, 1, 1);
        assert_eq!(proof.dependent_tx_id, "tx1");
        assert_eq!(tracker.get("k1").expect("entry").last_writer_tx_id, "tx2");
    }

    #[test]
    fn test_rewrite_by_same_tx_is_not_a_conflict() {
        let tracker = tracker(Duration::from_secs(300));
        tracker.check_and_update(&write_req("tx1", "k1", b"v1"), 1, 1, 1);
        let proof = tracker.check_and_update(&write_req("tx1", "k1", b"v2"), 2, 1, 1);
        assert!(proof.dependent_tx_id.is_empty());
    }

    #[test]
    fn test_most_recent_conflicting_writer_wins() {
        let tracker = tracker(Duration::from_secs(300));
        tracker.check_and_update(&write_req("txA", "a", b"1"), 1, 1, 1);
        tracker.check_and_update(&write_req("txB", "b", b"2"), 2, 1, 1);

        let req = PrepareRequest {
            tx_id: "tx3".to_string(),
            shard_id: "alpha".to_string(),
            read_set: BTreeMap::from([
                ("a".to_string(), Vec::new()),
                ("b".to_string(), Vec::new()),
            ]),
            write_set: BTreeMap::new(),
            timestamp_nanos: 0,
        };
        let proof = tracker.check_and_update(&req, 3, 1, 1);
        // Keys iterate in order, so the conflict on "b" is seen last.
        assert_eq!(proof.dependent_tx_id, "txB");
    }

    #[test]
    fn test_proof_signature_verifies() {
        let signer = ProofSigner::new(b"test-key".to_vec());
        let tracker = DependencyTracker::new("alpha", Duration::from_secs(300), signer.clone());
        let proof = tracker.check_and_update(&write_req("tx1", "k1", b"v1"), 5, 2, 1);
        assert!(signer.verify(&proof));
        assert_eq!(proof.term, 2);
    }

    #[test]
    fn test_remove_writer_releases_entries() {
        let tracker = tracker(Duration::from_secs(300));
        tracker.check_and_update(&write_req("tx1", "k1", b"v1"), 1, 1, 1);
        tracker.check_and_update(&write_req("tx1", "k2", b"v2"), 2, 1, 1);
        tracker.check_and_update(&write_req("tx2", "k3", b"v3"), 3, 1, 1);

        assert_eq!(tracker.remove_writer("tx1"), 2);
        assert_eq!(tracker.len(), 1);
        assert!(tracker.get("k3").is_some());

        // Idempotent for an unknown writer.
        assert_eq!(tracker.remove_writer("tx1"), 0);
    }

    #[test]
    fn test_sweep_removes_expired_entries() {
        let tracker = tracker(Duration::from_millis(1));
        tracker.check_and_update(&write_req("tx1", "k1", b"v1"), 1, 1, 1);
        std::thread::sleep(Duration::from_millis(10));

        assert_eq!(tracker.sweep_expired(), 1);
        assert!(tracker.is_empty());
        assert_eq!(tracker.expired_removed(), 1);

        // A later read of the swept key sees no dependency.
        let proof = tracker.check_and_update(&read_req("tx2", "k1"), 2, 1, 1);
        assert!(proof.dependent_tx_id.is_empty());
    }

    #[test]
    fn test_sweep_keeps_live_entries() {
        let tracker = tracker(Duration::from_secs(300));
        tracker.check_and_update(&write_req("tx1", "k1", b"v1"), 1, 1, 1);
        assert_eq!(tracker.sweep_expired(), 0);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_export_import_roundtrip() {
        let tracker = tracker(Duration::from_secs(300));
        tracker.check_and_update(&write_req("tx1", "k1", b"v1"), 1, 1, 1);
        tracker.check_and_update(&write_req("tx2", "k2", b"v2"), 2, 1, 1);

        let entries = tracker.export_entries();
        let restored = DependencyTracker::new(
            "alpha",
            Duration::from_secs(300),
            ProofSigner::new(b"test-key".to_vec()),
        );
        restored.import_entries(entries);
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.get("k2").expect("entry").last_writer_tx_id, "tx2");
    }
}

//! Simulation results and namespace grouping.
//!
//! The transaction simulator is an external collaborator; this module
//! models only what the coordinator consumes: per-namespace read and write
//! sets (public and private-collection), and the grouping of those keys
//! into per-shard prepare footprints.

use std::collections::BTreeMap;

/// Namespaces owned by system chaincodes, never routed to shards.
pub const SYSTEM_NAMESPACES: &[&str] = &["lscc", "cscc", "qscc", "escc", "vscc", "_lifecycle"];

/// Whether `namespace` belongs to a system chaincode.
pub fn is_system_namespace(namespace: &str) -> bool {
    SYSTEM_NAMESPACES.contains(&namespace)
}

/// One key read during simulation, with its observed version if known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRead {
    /// The key that was read.
    pub key: String,
    /// `(block_num, tx_num)` of the version read, when the ledger had one.
    pub version: Option<(u64, u64)>,
}

/// One key written during simulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyWrite {
    /// The key that would be overwritten.
    pub key: String,
    /// The value the transaction would commit.
    pub value: Vec<u8>,
}

/// Read/write set of one namespace (optionally one private collection).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceReadWriteSet {
    /// Owning namespace (chaincode).
    pub namespace: String,
    /// Private collection, when this set is private data.
    pub collection: Option<String>,
    /// Keys read.
    pub reads: Vec<KeyRead>,
    /// Keys written.
    pub writes: Vec<KeyWrite>,
}

impl NamespaceReadWriteSet {
    /// A public read/write set for `namespace`.
    pub fn public(namespace: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), ..Default::default() }
    }

    /// A private-collection read/write set.
    pub fn private(namespace: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            collection: Some(collection.into()),
            ..Default::default()
        }
    }

    /// Adds a read of `key` at `version`.
    pub fn read(mut self, key: impl Into<String>, version: Option<(u64, u64)>) -> Self {
        self.reads.push(KeyRead { key: key.into(), version });
        self
    }

    /// Adds a write of `key` with `value`.
    pub fn write(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.writes.push(KeyWrite { key: key.into(), value: value.into() });
        self
    }
}

/// What the simulator produced for one transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulationResult {
    /// The simulated transaction.
    pub tx_id: String,
    /// Read/write sets, public and private.
    pub sets: Vec<NamespaceReadWriteSet>,
}

/// The per-shard footprint extracted from a simulation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Footprint {
    /// Qualified keys read, mapped to their version bytes.
    pub reads: BTreeMap<String, Vec<u8>>,
    /// Qualified keys written, mapped to the new values.
    pub writes: BTreeMap<String, Vec<u8>>,
}

impl Footprint {
    /// Whether nothing was read or written.
    pub fn is_empty(&self) -> bool {
        self.reads.is_empty() && self.writes.is_empty()
    }
}

/// Formats a key as `namespace[:collection]:key`.
fn qualified_key(namespace: &str, collection: Option<&str>, key: &str) -> String {
    match collection {
        Some(collection) => format!("{namespace}:{collection}:{key}"),
        None => format!("{namespace}:{key}"),
    }
}

/// Version bytes carried as the read value, `"<block>-<txnum>"`.
fn version_bytes(version: Option<(u64, u64)>) -> Vec<u8> {
    match version {
        Some((block_num, tx_num)) => format!("{block_num}-{tx_num}").into_bytes(),
        None => Vec::new(),
    }
}

/// Groups a simulation's keys into per-namespace footprints.
///
/// System namespaces are skipped entirely. Keys are qualified with their
/// namespace (and collection for private data) so one shard's map never
/// aliases keys of another collection.
pub fn group_by_namespace(simulation: &SimulationResult) -> BTreeMap<String, Footprint> {
    let mut footprints: BTreeMap<String, Footprint> = BTreeMap::new();

    for set in &simulation.sets {
        if set.namespace.is_empty() || is_system_namespace(&set.namespace) {
            continue;
        }
        let footprint = footprints.entry(set.namespace.clone()).or_default();
        let collection = set.collection.as_deref();

        for write in &set.writes {
            footprint.writes.insert(
                qualified_key(&set.namespace, collection, &write.key),
                write.value.clone(),
            );
        }
        for read in &set.reads {
            footprint
                .reads
                .insert(
                    qualified_key(&set.namespace, collection, &read.key),
                    version_bytes(read.version),
                );
        }
    }

    footprints
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_system_namespaces() {
        assert!(is_system_namespace("lscc"));
        assert!(is_system_namespace("_lifecycle"));
        assert!(!is_system_namespace("fabcar"));
    }

    #[test]
    fn test_group_qualifies_keys() {
        let sim = SimulationResult {
            tx_id: "tx1".to_string(),
            sets: vec![
                NamespaceReadWriteSet::public("fabcar")
                    .read("car1", Some((4, 2)))
                    .write("car2", b"blue".to_vec()),
                NamespaceReadWriteSet::private("fabcar", "owners").write("o1", b"p".to_vec()),
            ],
        };

        let footprints = group_by_namespace(&sim);
        assert_eq!(footprints.len(), 1);

        let fp = &footprints["fabcar"];
        assert_eq!(fp.reads["fabcar:car1"], b"4-2".to_vec());
        assert_eq!(fp.writes["fabcar:car2"], b"blue".to_vec());
        assert_eq!(fp.writes["fabcar:owners:o1"], b"p".to_vec());
    }

    #[test]
    fn test_group_skips_system_namespaces() {
        let sim = SimulationResult {
            tx_id: "tx1".to_string(),
            sets: vec![
                NamespaceReadWriteSet::public("lscc").read("fabcar", None),
                NamespaceReadWriteSet::public("marbles").write("m1", b"1".to_vec()),
            ],
        };

        let footprints = group_by_namespace(&sim);
        assert_eq!(footprints.len(), 1);
        assert!(footprints.contains_key("marbles"));
    }

    #[test]
    fn test_group_splits_namespaces() {
        let sim = SimulationResult {
            tx_id: "tx1".to_string(),
            sets: vec![
                NamespaceReadWriteSet::public("fabcar").write("k", b"1".to_vec()),
                NamespaceReadWriteSet::public("marbles").write("k", b"2".to_vec()),
            ],
        };

        let footprints = group_by_namespace(&sim);
        assert_eq!(footprints.len(), 2);
        assert_eq!(footprints["fabcar"].writes["fabcar:k"], b"1".to_vec());
        assert_eq!(footprints["marbles"].writes["marbles:k"], b"2".to_vec());
    }

    #[test]
    fn test_read_without_version_is_empty_bytes() {
        let sim = SimulationResult {
            tx_id: "tx1".to_string(),
            sets: vec![NamespaceReadWriteSet::public("fabcar").read("car1", None)],
        };
        let footprints = group_by_namespace(&sim);
        assert_eq!(footprints["fabcar"].reads["fabcar:car1"], Vec::<u8>::new());
    }
}

//! In-memory Raft storage for a shard group.
//!
//! Implements the combined (deprecated but non-sealed) `RaftStorage` trait:
//! log, vote, and snapshots live in memory, and the state-machine side
//! applies committed records to the shard's [`DependencyTracker`]. Loss on
//! restart is acceptable for this service; the map refills as new
//! transactions arrive.

use std::{collections::BTreeMap, fmt::Debug, io::Cursor, ops::RangeBounds, sync::Arc};

use openraft::{
    AnyError, Entry, EntryPayload, LogId, OptionalSend, RaftStorage, SnapshotMeta, StorageError,
    StoredMembership, Vote,
    storage::{LogState, RaftLogReader, RaftSnapshotBuilder, Snapshot},
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tessera_proto::codec::{LogCommand, decode_record};
use tessera_types::ReplicaId;
use tracing::warn;

use crate::{
    dependency::{DependencyEntry, DependencyTracker},
    types::{ShardResponse, ShardTypeConfig},
};

/// Applied-state bookkeeping shared with snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AppliedMeta {
    /// Last applied log id.
    last_applied: Option<LogId<ReplicaId>>,
    /// Stored membership configuration.
    membership: StoredMembership<ReplicaId, openraft::BasicNode>,
}

/// Serialized snapshot payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotPayload {
    meta: AppliedMeta,
    entries: Vec<(String, DependencyEntry)>,
}

/// A finished snapshot held in memory.
#[derive(Debug, Clone)]
struct StoredSnapshot {
    meta: SnapshotMeta<ReplicaId, openraft::BasicNode>,
    data: Vec<u8>,
}

/// In-memory log store and state machine for one shard replica.
#[derive(Clone)]
pub struct MemShardStore {
    log: Arc<RwLock<BTreeMap<u64, Entry<ShardTypeConfig>>>>,
    vote: Arc<RwLock<Option<Vote<ReplicaId>>>>,
    last_purged: Arc<RwLock<Option<LogId<ReplicaId>>>>,
    applied: Arc<RwLock<AppliedMeta>>,
    snapshot: Arc<RwLock<Option<StoredSnapshot>>>,
    tracker: Arc<DependencyTracker>,
    max_record_len: usize,
}

impl MemShardStore {
    /// Creates an empty store applying into `tracker`.
    pub fn new(tracker: Arc<DependencyTracker>, max_record_len: usize) -> Self {
        Self {
            log: Arc::new(RwLock::new(BTreeMap::new())),
            vote: Arc::new(RwLock::new(None)),
            last_purged: Arc::new(RwLock::new(None)),
            applied: Arc::new(RwLock::new(AppliedMeta::default())),
            snapshot: Arc::new(RwLock::new(None)),
            tracker,
            max_record_len,
        }
    }

    /// Applies one committed entry, producing its response.
    fn apply_entry(&self, entry: &Entry<ShardTypeConfig>) -> ShardResponse {
        match &entry.payload {
            EntryPayload::Blank => ShardResponse::Empty,
            EntryPayload::Membership(membership) => {
                let mut applied = self.applied.write();
                applied.membership =
                    StoredMembership::new(Some(entry.log_id), membership.clone());
                ShardResponse::Empty
            },
            EntryPayload::Normal(record) => {
                let commit_index = entry.log_id.index;
                let term = entry.log_id.leader_id.term;
                let leader_id = entry.log_id.leader_id.node_id;

                match decode_record(&record.data, self.max_record_len) {
                    Ok(LogCommand::Batch(batch)) => {
                        let proofs = batch
                            .requests
                            .iter()
                            .map(|request| {
                                self.tracker.check_and_update(
                                    request,
                                    commit_index,
                                    term,
                                    leader_id,
                                )
                            })
                            .collect();
                        ShardResponse::Prepared { proofs }
                    },
                    Ok(LogCommand::Abort(abort)) => {
                        let removed = self.tracker.remove_writer(&abort.tx_id);
                        ShardResponse::Aborted { removed }
                    },
                    Err(err) => {
                        // A bad record must not wedge the shard: count it,
                        // skip it, keep applying.
                        self.tracker.record_bad_entry();
                        warn!(
                            shard_id = %self.tracker.shard_id(),
                            index = commit_index,
                            error = %err,
                            "skipping malformed log record"
                        );
                        ShardResponse::Rejected { reason: err.to_string() }
                    },
                }
            },
        }
    }

    fn snapshot_payload(&self) -> SnapshotPayload {
        SnapshotPayload {
            meta: self.applied.read().clone(),
            entries: self.tracker.export_entries(),
        }
    }
}

fn to_serde_error(e: &tessera_types::CodecError) -> StorageError<ReplicaId> {
    StorageError::IO {
        source: openraft::StorageIOError::write_snapshot(None, AnyError::error(e.to_string())),
    }
}

// ============================================================================
// RaftLogReader
// ============================================================================

impl RaftLogReader<ShardTypeConfig> for MemShardStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<ShardTypeConfig>>, StorageError<ReplicaId>> {
        let log = self.log.read();
        Ok(log.range(range).map(|(_, entry)| entry.clone()).collect())
    }
}

// ============================================================================
// RaftSnapshotBuilder
// ============================================================================

/// Snapshot builder holding a point-in-time copy of the applied state.
pub struct MemSnapshotBuilder {
    payload: SnapshotPayload,
    store: MemShardStore,
}

impl RaftSnapshotBuilder<ShardTypeConfig> for MemSnapshotBuilder {
    async fn build_snapshot(
        &mut self,
    ) -> Result<Snapshot<ShardTypeConfig>, StorageError<ReplicaId>> {
        let data = tessera_types::encode_payload("snapshot", &self.payload)
            .map_err(|e| to_serde_error(&e))?;

        let last_applied = self.payload.meta.last_applied;
        let snapshot_id = format!(
            "snapshot-{}",
            last_applied.map_or(0, |id| id.index),
        );

        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership: self.payload.meta.membership.clone(),
            snapshot_id,
        };

        *self.store.snapshot.write() =
            Some(StoredSnapshot { meta: meta.clone(), data: data.clone() });

        Ok(Snapshot { meta, snapshot: Box::new(Cursor::new(data)) })
    }
}

// ============================================================================
// RaftStorage (deprecated but non-sealed combined trait)
// ============================================================================

#[allow(deprecated)]
impl RaftStorage<ShardTypeConfig> for MemShardStore {
    type LogReader = Self;
    type SnapshotBuilder = MemSnapshotBuilder;

    async fn get_log_state(
        &mut self,
    ) -> Result<LogState<ShardTypeConfig>, StorageError<ReplicaId>> {
        let last_purged = *self.last_purged.read();
        let last_log_id = self
            .log
            .read()
            .iter()
            .next_back()
            .map(|(_, entry)| entry.log_id)
            .or(last_purged);

        Ok(LogState { last_purged_log_id: last_purged, last_log_id })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(
        &mut self,
        vote: &Vote<ReplicaId>,
    ) -> Result<(), StorageError<ReplicaId>> {
        *self.vote.write() = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<ReplicaId>>, StorageError<ReplicaId>> {
        Ok(*self.vote.read())
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<ReplicaId>>
    where
        I: IntoIterator<Item = Entry<ShardTypeConfig>> + OptionalSend,
    {
        let mut log = self.log.write();
        for entry in entries {
            log.insert(entry.log_id.index, entry);
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<ReplicaId>,
    ) -> Result<(), StorageError<ReplicaId>> {
        let mut log = self.log.write();
        log.split_off(&log_id.index);
        Ok(())
    }

    async fn purge_logs_upto(
        &mut self,
        log_id: LogId<ReplicaId>,
    ) -> Result<(), StorageError<ReplicaId>> {
        {
            let mut log = self.log.write();
            let keep = log.split_off(&(log_id.index + 1));
            *log = keep;
        }
        *self.last_purged.write() = Some(log_id);
        Ok(())
    }

    async fn last_applied_state(
        &mut self,
    ) -> Result<
        (Option<LogId<ReplicaId>>, StoredMembership<ReplicaId, openraft::BasicNode>),
        StorageError<ReplicaId>,
    > {
        let applied = self.applied.read();
        Ok((applied.last_applied, applied.membership.clone()))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<ShardTypeConfig>],
    ) -> Result<Vec<ShardResponse>, StorageError<ReplicaId>> {
        let mut responses = Vec::with_capacity(entries.len());

        for entry in entries {
            let response = self.apply_entry(entry);
            self.applied.write().last_applied = Some(entry.log_id);
            responses.push(response);
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        MemSnapshotBuilder { payload: self.snapshot_payload(), store: self.clone() }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<ReplicaId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<ReplicaId, openraft::BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<ReplicaId>> {
        let data = snapshot.into_inner();

        let payload: SnapshotPayload =
            tessera_types::decode_payload("snapshot", &data).map_err(|e| StorageError::IO {
                source: openraft::StorageIOError::read_snapshot(
                    Some(meta.signature()),
                    AnyError::error(e.to_string()),
                ),
            })?;

        self.tracker.import_entries(payload.entries);
        {
            let mut applied = self.applied.write();
            applied.last_applied = meta.last_log_id;
            applied.membership = meta.last_membership.clone();
        }
        *self.snapshot.write() = Some(StoredSnapshot { meta: meta.clone(), data });

        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<ShardTypeConfig>>, StorageError<ReplicaId>> {
        let stored = self.snapshot.read().clone();
        Ok(stored.map(|snapshot| Snapshot {
            meta: snapshot.meta,
            snapshot: Box::new(Cursor::new(snapshot.data)),
        }))
    }
}

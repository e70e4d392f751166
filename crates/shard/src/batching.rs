//! Request batching for the shard proposer.
//!
//! The batcher drains the bounded propose queue and coalesces requests into
//! prepare batches, flushing when the batch is full or the oldest pending
//! request reaches the batch timeout. Each caller holds a oneshot receiver
//! that resolves with its proof once the batch commits and applies.
//!
//! Only the leader proposes. A batch flushed on a follower is held and
//! retried until leadership changes; callers that cannot wait time out at
//! the endorser and the held requests fail at shutdown.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use openraft::{Raft, error::ClientWriteError, error::RaftError};
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::Instant,
};
use tracing::{debug, info, warn};

use tessera_proto::codec::encode_batch;
use tessera_types::{PrepareBatch, PrepareProof, PrepareRequest, ReplicaId};

use crate::{
    error::ShardError,
    types::{LogRecord, ShardResponse, ShardTypeConfig},
};

/// Delay before re-attempting a flush that was held for leadership.
const HOLD_RETRY: Duration = Duration::from_millis(100);

/// A queued prepare request and its completion channel.
pub(crate) struct PendingPrepare {
    pub request: PrepareRequest,
    pub responder: oneshot::Sender<Result<PrepareProof, ShardError>>,
    pub queued_at: Instant,
}

/// Batching proposer for one shard replica.
pub(crate) struct Batcher {
    shard_id: String,
    node_id: ReplicaId,
    raft: Arc<Raft<ShardTypeConfig>>,
    rx: mpsc::Receiver<PendingPrepare>,
    shutdown: watch::Receiver<bool>,
    batch_timeout: Duration,
    max_batch_size: usize,
    max_msg_size: usize,
    /// Earliest time the next flush may run after a leadership hold.
    not_before: Option<Instant>,
}

impl Batcher {
    pub(crate) fn new(
        shard_id: String,
        node_id: ReplicaId,
        raft: Arc<Raft<ShardTypeConfig>>,
        rx: mpsc::Receiver<PendingPrepare>,
        shutdown: watch::Receiver<bool>,
        batch_timeout: Duration,
        max_batch_size: usize,
        max_msg_size: usize,
    ) -> Self {
        Self {
            shard_id,
            node_id,
            raft,
            rx,
            shutdown,
            batch_timeout,
            max_batch_size,
            max_msg_size,
            not_before: None,
        }
    }

    fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.node_id)
    }

    /// Runs the batching loop until shutdown.
    pub(crate) async fn run(mut self) {
        info!(
            shard_id = %self.shard_id,
            batch_timeout_ms = self.batch_timeout.as_millis() as u64,
            max_batch_size = self.max_batch_size,
            "starting batcher"
        );

        let mut pending: VecDeque<PendingPrepare> = VecDeque::new();

        loop {
            let age_deadline = pending.front().map(|front| {
                let base = front.queued_at + self.batch_timeout;
                match self.not_before {
                    Some(not_before) => base.max(not_before),
                    None => base,
                }
            });

            tokio::select! {
                _ = self.shutdown.changed() => break,

                // Stop draining the queue once a full batch is pending;
                // backpressure then reaches callers as `Busy` instead of
                // accumulating unbounded work behind a leaderless flush.
                received = self.rx.recv(), if pending.len() < self.max_batch_size => {
                    match received {
                        Some(item) => {
                            pending.push_back(item);
                            if pending.len() >= self.max_batch_size {
                                self.flush(&mut pending).await;
                            }
                        },
                        None => break,
                    }
                },

                _ = tokio::time::sleep_until(age_deadline.unwrap_or_else(Instant::now)),
                    if age_deadline.is_some() =>
                {
                    self.flush(&mut pending).await;
                },
            }
        }

        // Shutdown: everything still queued or pending fails fast.
        while let Ok(item) = self.rx.try_recv() {
            pending.push_back(item);
        }
        let drained = pending.len();
        for item in pending {
            let _ = item.responder.send(Err(ShardError::ShuttingDown));
        }
        if drained > 0 {
            info!(shard_id = %self.shard_id, drained, "batcher drained on shutdown");
        }
        debug!(shard_id = %self.shard_id, "batcher stopped");
    }

    /// Proposes up to one batch from the pending queue.
    async fn flush(&mut self, pending: &mut VecDeque<PendingPrepare>) {
        if pending.is_empty() {
            return;
        }

        if !self.is_leader() {
            // Hold until leadership changes; the age timer retries.
            self.not_before = Some(Instant::now() + HOLD_RETRY);
            debug!(
                shard_id = %self.shard_id,
                held = pending.len(),
                "holding batch, replica is not the leader"
            );
            return;
        }
        self.not_before = None;

        let take = pending.len().min(self.max_batch_size);
        let drained: Vec<PendingPrepare> = pending.drain(..take).collect();

        let batch = PrepareBatch {
            requests: drained.iter().map(|item| item.request.clone()).collect(),
        };
        let data = encode_batch(&batch);
        if data.len() > self.max_msg_size {
            warn!(
                shard_id = %self.shard_id,
                len = data.len(),
                max = self.max_msg_size,
                "dropping oversized batch"
            );
            let reason = format!(
                "encoded batch of {} bytes exceeds the {}-byte bound",
                data.len(),
                self.max_msg_size
            );
            for item in drained {
                let _ = item.responder.send(Err(ShardError::Proposal { message: reason.clone() }));
            }
            return;
        }

        debug!(shard_id = %self.shard_id, batch_size = drained.len(), "proposing batch");

        match self.raft.client_write(LogRecord::new(data)).await {
            Ok(response) => self.distribute(drained, response.data),
            Err(RaftError::APIError(ClientWriteError::ForwardToLeader(forward))) => {
                // Leadership moved between the check and the proposal; put
                // the batch back in order and retry after the hold delay.
                debug!(
                    shard_id = %self.shard_id,
                    leader = ?forward.leader_id,
                    "proposal forwarded, holding batch"
                );
                for item in drained.into_iter().rev() {
                    pending.push_front(item);
                }
                self.not_before = Some(Instant::now() + HOLD_RETRY);
            },
            Err(err) => {
                warn!(shard_id = %self.shard_id, error = %err, "batch proposal failed");
                let message = err.to_string();
                for item in drained {
                    let _ = item
                        .responder
                        .send(Err(ShardError::Proposal { message: message.clone() }));
                }
            },
        }
    }

    /// Completes the waiters of a committed batch, in request order.
    fn distribute(&self, drained: Vec<PendingPrepare>, response: ShardResponse) {
        match response {
            ShardResponse::Prepared { proofs } => {
                if proofs.len() != drained.len() {
                    warn!(
                        shard_id = %self.shard_id,
                        expected = drained.len(),
                        got = proofs.len(),
                        "proof count mismatch"
                    );
                }
                let mut proofs = proofs.into_iter();
                for item in drained {
                    match proofs.next() {
                        Some(proof) => {
                            let _ = item.responder.send(Ok(proof));
                        },
                        None => {
                            let _ = item.responder.send(Err(ShardError::Proposal {
                                message: "batch applied without a proof for this request"
                                    .to_string(),
                            }));
                        },
                    }
                }
            },
            ShardResponse::Rejected { reason } => {
                for item in drained {
                    let _ = item
                        .responder
                        .send(Err(ShardError::Proposal { message: reason.clone() }));
                }
            },
            other => {
                warn!(shard_id = %self.shard_id, ?other, "unexpected apply response for batch");
                for item in drained {
                    let _ = item.responder.send(Err(ShardError::Proposal {
                        message: "unexpected apply response for batch".to_string(),
                    }));
                }
            },
        }
    }
}

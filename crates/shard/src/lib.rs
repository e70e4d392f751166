//! Per-shard replicated state machine for Tessera.
//!
//! This crate provides:
//! - The shard replica: a Raft group member with a batching proposer, an
//!   in-memory replicated log, and a deterministic apply loop that updates
//!   the dependency map and emits signed prepare proofs
//! - The shard manager, multiplexing namespaces to lazily created shards
//! - The gRPC consensus transport between the replicas of one shard

#![deny(unsafe_code)]
// gRPC services return tonic::Status - standard practice for gRPC error handling
#![allow(clippy::result_large_err)]

mod batching;
pub mod dependency;
pub mod error;
mod manager;
mod network;
mod replica;
mod service;
mod store;
pub mod types;

pub use dependency::{DependencyEntry, DependencyTracker};
pub use error::ShardError;
pub use manager::ShardManager;
pub use network::{GrpcShardNetwork, GrpcShardNetworkFactory};
pub use replica::{PROPOSE_QUEUE_CAPACITY, ShardReplica};
pub use service::{ShardHealthService, ShardRaftService};
pub use store::MemShardStore;
pub use types::{LogRecord, ShardResponse, ShardTypeConfig};

//! Core types for the Tessera dependency-tracking service.
//!
//! This crate defines the data model shared by every other Tessera crate:
//! prepare requests and proofs, the abort record, proof signing, and the
//! service configuration (including shard topology resolution).

#![deny(unsafe_code)]

pub mod codec;
pub mod config;
pub mod prepare;
pub mod signing;

pub use codec::{CodecError, decode_payload, encode_payload};
pub use config::{
    BreakerSettings, ShardConfig, ShardTopology, TesseraConfig, TopologyError,
};
pub use prepare::{AbortEntry, PrepareBatch, PrepareProof, PrepareRequest, RequestError};
pub use signing::ProofSigner;

/// Identifier of one replica within a shard group.
///
/// Replica ids are 1-based, contiguous indices into the shard's
/// `replica_nodes` list and double as the Raft node id.
pub type ReplicaId = u64;

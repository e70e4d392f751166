//! Protobuf types and the canonical log codec for Tessera.
//!
//! This crate provides:
//! - Generated protobuf types and gRPC service traits ([`proto`])
//! - Bidirectional conversions between domain types and proto types
//!   ([`convert`])
//! - The canonical serialization of replicated-log payloads ([`codec`])
//!
//! Kept separate from the consensus crate so that consumers needing only
//! wire-format types can avoid pulling in Raft internals.

#![deny(unsafe_code)]
// gRPC services return tonic::Status - standard practice for gRPC error handling
#![allow(clippy::result_large_err)]

/// Generated protobuf types and service traits.
pub mod proto {
    #![allow(clippy::all)]
    #![allow(missing_docs)]

    tonic::include_proto!("tessera.v1");
}

pub mod codec;
pub mod convert;

pub use codec::{LogCommand, WireError, decode_record, encode_abort, encode_batch};

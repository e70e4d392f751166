//! Canonical serialization for replicated-log payloads.
//!
//! Every record placed in a shard's log is either a prepare batch or an
//! abort entry, wrapped in a [`proto::LogRecord`] envelope. The encoding is
//! deterministic for identical structures (key sets are emitted in key
//! order) and tolerant of unknown fields, so replicas running newer schema
//! revisions interoperate with older ones. Integrity is consensus's job;
//! there is no cryptographic framing here.

use prost::Message;
use snafu::{ResultExt, Snafu};
use tessera_types::{AbortEntry, PrepareBatch};

use crate::proto;

/// Errors raised while decoding a log record.
#[derive(Debug, Snafu)]
pub enum WireError {
    /// The record exceeds the configured per-entry size bound.
    #[snafu(display("log record of {len} bytes exceeds the {max}-byte bound"))]
    Oversized {
        /// Encoded length observed.
        len: usize,
        /// Configured bound.
        max: usize,
    },

    /// The bytes are not a valid record envelope.
    #[snafu(display("malformed log record: {source}"))]
    Malformed {
        /// Underlying prost error.
        source: prost::DecodeError,
    },

    /// The envelope carries neither a batch nor an abort.
    #[snafu(display("log record envelope is empty"))]
    EmptyRecord,
}

/// A decoded log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogCommand {
    /// An ordered group of prepare requests.
    Batch(PrepareBatch),
    /// A transaction abort.
    Abort(AbortEntry),
}

/// Encodes a prepare batch into canonical record bytes.
pub fn encode_batch(batch: &PrepareBatch) -> Vec<u8> {
    let record = proto::LogRecord {
        record: Some(proto::log_record::Record::Batch((batch).into())),
    };
    record.encode_to_vec()
}

/// Encodes an abort entry into canonical record bytes.
pub fn encode_abort(abort: &AbortEntry) -> Vec<u8> {
    let record = proto::LogRecord {
        record: Some(proto::log_record::Record::Abort(abort.into())),
    };
    record.encode_to_vec()
}

/// Decodes record bytes, enforcing the per-entry size bound.
///
/// # Errors
///
/// Returns [`WireError::Oversized`] for records above `max_len`,
/// [`WireError::Malformed`] for bytes prost cannot parse, and
/// [`WireError::EmptyRecord`] for an envelope with no payload.
pub fn decode_record(bytes: &[u8], max_len: usize) -> Result<LogCommand, WireError> {
    if bytes.len() > max_len {
        return Err(WireError::Oversized { len: bytes.len(), max: max_len });
    }
    let record = proto::LogRecord::decode(bytes).context(MalformedSnafu)?;
    match record.record {
        Some(proto::log_record::Record::Batch(batch)) => Ok(LogCommand::Batch(batch.into())),
        Some(proto::log_record::Record::Abort(abort)) => Ok(LogCommand::Abort(abort.into())),
        None => Err(WireError::EmptyRecord),
    }
}

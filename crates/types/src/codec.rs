//! Byte encoding for replica-internal payloads.
//!
//! Two kinds of bytes move through a shard replica without touching the
//! canonical log format owned by `tessera-proto`: consensus entries shipped
//! between replicas and snapshot blobs of the applied state. Both are
//! postcard-encoded here, and every error names the payload surface it came
//! from, so a decode failure in a log reads as "decoding raft entry failed"
//! rather than a bare serialization error.

use serde::{Serialize, de::DeserializeOwned};
use snafu::Snafu;

/// Error type for internal payload encoding.
#[derive(Debug, Snafu)]
pub enum CodecError {
    /// A payload could not be serialized.
    #[snafu(display("encoding {payload} failed: {source}"))]
    Encode {
        /// The byte surface being written (e.g. `"raft entry"`).
        payload: &'static str,
        /// The underlying postcard error.
        source: postcard::Error,
    },

    /// A payload could not be deserialized.
    #[snafu(display("decoding {payload} failed: {source}"))]
    Decode {
        /// The byte surface being read.
        payload: &'static str,
        /// The underlying postcard error.
        source: postcard::Error,
    },
}

/// Serializes an internal payload to postcard bytes.
///
/// `payload` names the byte surface for error reporting.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if serialization fails.
pub fn encode_payload<T: Serialize>(
    payload: &'static str,
    value: &T,
) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(value).map_err(|source| CodecError::Encode { payload, source })
}

/// Deserializes an internal payload from postcard bytes.
///
/// `payload` names the byte surface for error reporting.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] if deserialization fails.
pub fn decode_payload<T: DeserializeOwned>(
    payload: &'static str,
    bytes: &[u8],
) -> Result<T, CodecError> {
    postcard::from_bytes(bytes).map_err(|source| CodecError::Decode { payload, source })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, Deserialize)]
    struct Payload {
        index: u64,
        body: Vec<u8>,
    }

    #[test]
    fn test_roundtrip() {
        let original = Payload { index: 42, body: vec![0xAB, 0xCD] };
        let bytes = encode_payload("raft entry", &original).expect("encode");
        let decoded: Payload = decode_payload("raft entry", &bytes).expect("decode");
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_decode_error_names_the_surface() {
        let result: Result<Payload, _> = decode_payload("snapshot", &[0xFF, 0xFF, 0xFF]);
        let err = result.unwrap_err();
        assert!(matches!(err, CodecError::Decode { payload: "snapshot", .. }));
        assert!(err.to_string().starts_with("decoding snapshot failed"));
    }

    #[test]
    fn test_decode_rejects_truncated_bytes() {
        let original = Payload { index: 7, body: vec![1, 2, 3, 4] };
        let bytes = encode_payload("raft entry", &original).expect("encode");
        let result: Result<Payload, _> = decode_payload("raft entry", &bytes[..2]);
        assert!(result.is_err());
    }

    #[test]
    fn test_decode_rejects_empty_input() {
        let result: Result<u64, _> = decode_payload("raft entry", &[]);
        assert!(result.is_err());
    }
}

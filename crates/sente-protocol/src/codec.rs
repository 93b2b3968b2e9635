//! Self-describing wire codec.
//!
//! The source design's reference codec is EDN (keywords, vectors, nil all
//! native). This crate's stack carries `serde`/`serde_json` instead, so the
//! codec maps event-ids to `"ns/name"` strings per §6 of the spec and lets
//! every other value ride through as a `serde_json::Value`. Binary payloads
//! are not natively representable in JSON; applications that need them
//! base64-encode the bytes into a string field and round-trip byte-for-byte
//! through that convention (see DESIGN.md).

use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("parse-failed: {0}")]
    ParseFailed(String),
}

/// Map a value to and from wire bytes without ever panicking on malformed
/// input.
pub trait Codec: Send + Sync {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError>;
}

/// The reference codec: JSON text, UTF-8 encoded.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::ParseFailed(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::ParseFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_nested_values() {
        let codec = JsonCodec;
        let value = json!({"id": "app/foo", "data": {"n": 42, "tags": ["a", "b"], "nil": null}});
        let bytes = codec.encode(&value).unwrap();
        let back = codec.decode(&bytes).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn malformed_input_returns_error_not_panic() {
        let codec = JsonCodec;
        let err = codec.decode(b"{not-json").unwrap_err();
        assert!(matches!(err, CodecError::ParseFailed(_)));
    }

    #[test]
    fn empty_input_returns_error() {
        let codec = JsonCodec;
        assert!(codec.decode(b"").is_err());
    }
}

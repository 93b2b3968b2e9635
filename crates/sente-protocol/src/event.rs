//! Wire protocol: encode/decode events, callback-wrapped events and batches.

use serde_json::Value;

use crate::codec::{Codec, CodecError};
use crate::event_id::{EventId, InvalidEventId};

/// A decoded event: `[event-id, data]`. `data` is `Value::Null` when the
/// event carries no payload — JSON has no distinct "absent" shape, so nil
/// and absent are the same thing on the wire, as they are in EDN.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: EventId,
    pub data: Value,
}

impl Event {
    pub fn new(id: EventId, data: Value) -> Self {
        Self { id, data }
    }
}

/// The three shapes `decode_inbound` can produce for a single inbound
/// frame, plus the callback-wrapped variant. Replies (`chsk/reply`) are
/// ordinary `Single` events; callers distinguish them by event-id.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedInbound {
    Single(Event),
    Batch(Vec<Event>),
    CallbackWrapped { event: Event, cb_uuid: String },
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    InvalidEventId(#[from] InvalidEventId),
    #[error("parse-failed: {0}")]
    MalformedShape(String),
}

/// `encode-event(id, data?) -> event-vector`
pub fn encode_event(id: &EventId, data: Value) -> Value {
    Value::Array(vec![Value::String(id.as_str().to_owned()), data])
}

/// `encode-event-with-callback(id, data?, cb-uuid?) -> [event-vector, cb-uuid]`
///
/// Allocates a fresh UUID when `cb_uuid` is `None`.
pub fn encode_event_with_callback(id: &EventId, data: Value, cb_uuid: Option<String>) -> (Value, String) {
    let cb_uuid = cb_uuid.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let wrapped = Value::Array(vec![encode_event(id, data), Value::String(cb_uuid.clone())]);
    (wrapped, cb_uuid)
}

/// Decode a raw wire frame into one of the inbound shapes, per the shape
/// heuristic in §4.2: a two-element vector whose second element is a
/// string is always callback-wrapped, never a batch-of-one; an empty
/// vector is an empty batch; otherwise, the outer vector is a batch iff its
/// first element is itself a vector starting with a namespaced identifier.
pub fn decode_inbound(bytes: &[u8], codec: &dyn Codec) -> Result<DecodedInbound, WireError> {
    let value = codec.decode(bytes)?;
    decode_value(value)
}

/// Same as [`decode_inbound`] but operating on an already-decoded value
/// (useful once a transport has handed back a parsed JSON frame).
pub fn decode_value(value: Value) -> Result<DecodedInbound, WireError> {
    let arr = match value {
        Value::Array(arr) => arr,
        other => {
            return Err(WireError::MalformedShape(format!(
                "expected a top-level array, got {other}"
            )))
        }
    };

    if arr.is_empty() {
        return Ok(DecodedInbound::Batch(Vec::new()));
    }

    if arr.len() == 2 && arr[1].is_string() {
        let mut iter = arr.into_iter();
        let event = parse_event(iter.next().unwrap())?;
        let cb_uuid = iter.next().unwrap().as_str().unwrap().to_owned();
        return Ok(DecodedInbound::CallbackWrapped { event, cb_uuid });
    }

    if is_batch_shape(&arr) {
        let events = arr
            .into_iter()
            .map(parse_event)
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(DecodedInbound::Batch(events));
    }

    Ok(DecodedInbound::Single(parse_event(Value::Array(arr))?))
}

fn is_batch_shape(arr: &[Value]) -> bool {
    matches!(
        arr.first(),
        Some(Value::Array(inner)) if inner.first().map(Value::is_string).unwrap_or(false)
    )
}

fn parse_event(value: Value) -> Result<Event, WireError> {
    let mut arr = match value {
        Value::Array(arr) => arr,
        other => {
            return Err(WireError::MalformedShape(format!(
                "expected an event array, got {other}"
            )))
        }
    };
    if arr.is_empty() || arr.len() > 2 {
        return Err(WireError::MalformedShape(format!(
            "event array must have 1 or 2 elements, got {}",
            arr.len()
        )));
    }
    let data = if arr.len() == 2 { arr.pop().unwrap() } else { Value::Null };
    let id_value = arr.pop().unwrap();
    let id_str = id_value
        .as_str()
        .ok_or_else(|| WireError::MalformedShape(format!("event-id must be a string, got {id_value}")))?;
    let id = EventId::parse(id_str)?;
    Ok(Event { id, data })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use serde_json::json;

    fn id(s: &str) -> EventId {
        EventId::parse(s).unwrap()
    }

    #[test]
    fn single_event_round_trips() {
        let codec = JsonCodec;
        let wire = encode_event(&id("app/ping"), json!({"n": 1}));
        let bytes = codec.encode(&wire).unwrap();
        match decode_inbound(&bytes, &codec).unwrap() {
            DecodedInbound::Single(event) => {
                assert_eq!(event.id, id("app/ping"));
                assert_eq!(event.data, json!({"n": 1}));
            }
            other => panic!("expected Single, got {other:?}"),
        }
    }

    #[test]
    fn empty_vector_decodes_as_empty_batch() {
        let codec = JsonCodec;
        let bytes = codec.encode(&json!([])).unwrap();
        assert_eq!(
            decode_inbound(&bytes, &codec).unwrap(),
            DecodedInbound::Batch(vec![])
        );
    }

    #[test]
    fn callback_wrapped_event_is_never_mistaken_for_a_batch() {
        let codec = JsonCodec;
        let (wire, cb_uuid) = encode_event_with_callback(&id("app/rpc"), json!(null), None);
        let bytes = codec.encode(&wire).unwrap();
        match decode_inbound(&bytes, &codec).unwrap() {
            DecodedInbound::CallbackWrapped { event, cb_uuid: got } => {
                assert_eq!(event.id, id("app/rpc"));
                assert_eq!(got, cb_uuid);
            }
            other => panic!("expected CallbackWrapped, got {other:?}"),
        }
    }

    #[test]
    fn batch_of_events_decodes_in_order() {
        let codec = JsonCodec;
        let wire = json!([
            encode_event(&id("app/a"), json!(1)),
            encode_event(&id("app/b"), json!(2)),
        ]);
        let bytes = codec.encode(&wire).unwrap();
        match decode_inbound(&bytes, &codec).unwrap() {
            DecodedInbound::Batch(events) => {
                assert_eq!(events.len(), 2);
                assert_eq!(events[0].id, id("app/a"));
                assert_eq!(events[1].id, id("app/b"));
            }
            other => panic!("expected Batch, got {other:?}"),
        }
    }

    #[test]
    fn invalid_event_id_fails_decode_without_panicking() {
        let codec = JsonCodec;
        let bytes = codec.encode(&json!(["unqualified", null])).unwrap();
        assert!(decode_inbound(&bytes, &codec).is_err());
    }

    #[test]
    fn malformed_bytes_never_panic() {
        let codec = JsonCodec;
        assert!(decode_inbound(b"{not-json", &codec).is_err());
        assert!(decode_inbound(b"\"just-a-string\"", &codec).is_err());
    }
}

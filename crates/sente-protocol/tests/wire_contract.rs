//! End-to-end wire-shape contract tests, mirroring the literal JSON shapes
//! from the spec's external-interfaces section.

use sente_protocol::{channel, decode_inbound, encode_event, encode_event_with_callback, system, DecodedInbound, Event, EventId, JsonCodec};
use serde_json::json;

fn id(s: &str) -> EventId {
    EventId::parse(s).unwrap()
}

#[test]
fn single_event_wire_shape_matches_spec() {
    let wire = encode_event(&id("test/echo"), json!({"n": 42}));
    assert_eq!(wire, json!(["test/echo", {"n": 42}]));
}

#[test]
fn callback_event_wire_shape_matches_spec() {
    let (wire, cb_uuid) = encode_event_with_callback(&id("app/rpc"), json!(1), Some("cb-123".to_owned()));
    assert_eq!(wire, json!([["app/rpc", 1], "cb-123"]));
    assert_eq!(cb_uuid, "cb-123");
}

#[test]
fn handshake_wire_shape_matches_spec() {
    let hs = system::Handshake {
        uid: "u1".to_owned(),
        csrf_token: None,
        data: None,
        first: true,
    };
    let event = hs.to_event();
    let wire = encode_event(&event.id, event.data);
    assert_eq!(wire, json!(["chsk/handshake", ["u1", null, null, true]]));
}

#[test]
fn full_pipeline_decodes_echo_default_reply() {
    let codec = JsonCodec;
    let echo = channel::Echo {
        original_event_id: "test/echo".to_owned(),
        original_data: json!({"n": 42}),
    };
    let event = echo.to_event();
    let bytes = codec.encode(&encode_event(&event.id, event.data.clone())).unwrap();

    match decode_inbound(&bytes, &codec).unwrap() {
        DecodedInbound::Single(Event { id, data }) => {
            assert_eq!(id, channel::echo_id());
            assert_eq!(channel::Echo::from_data(&data).unwrap(), echo);
        }
        other => panic!("expected Single, got {other:?}"),
    }
}

#[test]
fn batch_distinguishes_from_callback_wrapped_two_element_vector() {
    let codec = JsonCodec;
    // A batch of exactly two events must not be mistaken for a
    // callback-wrapped event, because neither element is a bare string.
    let batch = json!([
        encode_event(&id("app/a"), json!(1)),
        encode_event(&id("app/b"), json!(2)),
    ]);
    let bytes = codec.encode(&batch).unwrap();
    assert!(matches!(
        decode_inbound(&bytes, &codec).unwrap(),
        DecodedInbound::Batch(events) if events.len() == 2
    ));
}

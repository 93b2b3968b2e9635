//! sente-protocol: wire types and codec for the sente-lite messaging
//! protocol.
//!
//! An *event* is an ordered `[event-id, data?]` pair where `event-id` is a
//! namespaced identifier (`ns/name`). This crate owns the event-id type,
//! the JSON codec, the shape-based decoding of single/batch/callback-wrapped
//! frames, and the typed payloads for the reserved `chsk` (system) and
//! `sente-lite` (pub/sub + default reply) namespaces.

mod event_id;
mod codec;
mod event;

pub mod channel;
pub mod system;

pub use codec::{Codec, CodecError, JsonCodec};
pub use event::{decode_inbound, decode_value, encode_event, encode_event_with_callback, DecodedInbound, Event, WireError};
pub use event_id::{EventId, InvalidEventId};

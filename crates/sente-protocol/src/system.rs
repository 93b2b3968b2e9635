//! System events in the reserved `chsk` namespace.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::event::Event;
use crate::event_id;
use crate::event_id::EventId;

pub fn handshake_id() -> EventId {
    event_id!("chsk", "handshake")
}
pub fn ws_ping_id() -> EventId {
    event_id!("chsk", "ws-ping")
}
pub fn ws_pong_id() -> EventId {
    event_id!("chsk", "ws-pong")
}
pub fn recv_id() -> EventId {
    event_id!("chsk", "recv")
}
pub fn reply_id() -> EventId {
    event_id!("chsk", "reply")
}

/// `chsk/handshake [uid, csrf-token?, handshake-data?, first?]`
#[derive(Debug, Clone, PartialEq)]
pub struct Handshake {
    pub uid: String,
    pub csrf_token: Option<String>,
    pub data: Option<Value>,
    pub first: bool,
}

impl Handshake {
    pub fn to_event(&self) -> Event {
        Event::new(
            handshake_id(),
            json!([
                self.uid,
                self.csrf_token,
                self.data.clone().unwrap_or(Value::Null),
                self.first,
            ]),
        )
    }

    pub fn from_data(data: &Value) -> Option<Self> {
        let arr = data.as_array()?;
        let uid = arr.first()?.as_str()?.to_owned();
        let csrf_token = arr.get(1).and_then(Value::as_str).map(str::to_owned);
        let data = arr.get(2).filter(|v| !v.is_null()).cloned();
        let first = arr.get(3).and_then(Value::as_bool).unwrap_or(false);
        Some(Self {
            uid,
            csrf_token,
            data,
            first,
        })
    }
}

/// `chsk/reply {cb-uuid, data}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Reply {
    pub cb_uuid: String,
    pub data: Value,
}

impl Reply {
    pub fn to_event(&self) -> Event {
        Event::new(reply_id(), serde_json::to_value(self).expect("Reply always serializes"))
    }

    pub fn from_data(data: &Value) -> Option<Self> {
        serde_json::from_value(data.clone()).ok()
    }
}

/// `chsk-client/state [old-state, new-state]` — an internal transition
/// notification; it is never put on the wire, so it has no `EventId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    Reconnecting,
}

pub fn ws_ping_event() -> Event {
    Event::new(ws_ping_id(), json!([]))
}

pub fn ws_pong_event() -> Event {
    Event::new(ws_pong_id(), json!([]))
}

/// `wrap-recv(event) -> [chsk/recv, [event]]`
pub fn wrap_recv(event: &Event) -> Event {
    let inner = crate::event::encode_event(&event.id, event.data.clone());
    Event::new(recv_id(), json!([inner]))
}

/// Unwrap a `chsk/recv`-wrapped push back into the inner event. Returns
/// `None` (rather than erroring) for anything that isn't shaped like a
/// wrapped push — the `wrap-recv-evs?` flag is advisory, so callers must
/// tolerate both wrapped and unwrapped pushes (§9).
pub fn unwrap_recv(event: &Event) -> Option<Event> {
    if event.id != recv_id() {
        return None;
    }
    let inner = event.data.as_array()?.first()?.clone();
    let inner_arr = inner.as_array()?;
    let id = EventId::parse(inner_arr.first()?.as_str()?).ok()?;
    let data = inner_arr.get(1).cloned().unwrap_or(Value::Null);
    Some(Event::new(id, data))
}

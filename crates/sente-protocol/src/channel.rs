//! Extension events in the `sente-lite` namespace: pub/sub channels and the
//! default echo reply.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::Event;
use crate::event_id;
use crate::event_id::EventId;

pub fn subscribe_id() -> EventId {
    event_id!("sente-lite", "subscribe")
}
pub fn unsubscribe_id() -> EventId {
    event_id!("sente-lite", "unsubscribe")
}
pub fn subscribed_id() -> EventId {
    event_id!("sente-lite", "subscribed")
}
pub fn publish_id() -> EventId {
    event_id!("sente-lite", "publish")
}
pub fn channel_msg_id() -> EventId {
    event_id!("sente-lite", "channel-msg")
}
pub fn echo_id() -> EventId {
    event_id!("sente-lite", "echo")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Subscribe {
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Unsubscribe {
    pub channel_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Subscribed {
    pub channel_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Publish {
    pub channel_id: String,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ChannelMsg {
    pub channel_id: String,
    pub data: Value,
    pub from: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Echo {
    pub original_event_id: String,
    pub original_data: Value,
}

macro_rules! payload_event {
    ($ty:ty, $id_fn:path) => {
        impl $ty {
            pub fn to_event(&self) -> Event {
                Event::new($id_fn(), serde_json::to_value(self).expect("payload always serializes"))
            }

            pub fn from_data(data: &Value) -> Option<Self> {
                serde_json::from_value(data.clone()).ok()
            }
        }
    };
}

payload_event!(Subscribe, subscribe_id);
payload_event!(Unsubscribe, unsubscribe_id);
payload_event!(Subscribed, subscribed_id);
payload_event!(Publish, publish_id);
payload_event!(ChannelMsg, channel_msg_id);
payload_event!(Echo, echo_id);

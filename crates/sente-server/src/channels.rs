//! Channel Manager (spec §4.7): named pub/sub channels, fan-out, and a
//! small RPC correlation table layered over channel publishes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sente_protocol::channel::ChannelMsg;
use sente_protocol::Codec;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use crate::registry::ConnectionRegistry;

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub max_subscribers: Option<usize>,
    /// Diagnostic-only counter of recent publishes; NOT replay storage.
    pub message_retention: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self { max_subscribers: None, message_retention: 16 }
    }
}

pub struct Channel {
    pub channel_id: String,
    pub config: ChannelConfig,
    subscribers: Mutex<Vec<String>>,
    recent: Mutex<std::collections::VecDeque<Value>>,
}

#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub subscriber_count: usize,
    pub config: ChannelConfig,
}

#[derive(Debug, Clone)]
pub struct SubscribeOutcome {
    pub success: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub success: bool,
    pub delivered_to: usize,
}

pub struct ChannelManagerConfig {
    pub auto_create: bool,
    pub default_config: ChannelConfig,
}

impl Default for ChannelManagerConfig {
    fn default() -> Self {
        Self { auto_create: true, default_config: ChannelConfig::default() }
    }
}

struct PendingRpc {
    reply_tx: oneshot::Sender<Value>,
    deadline: Instant,
}

pub struct ChannelManager {
    channels: RwLock<HashMap<String, Arc<Channel>>>,
    config: ChannelManagerConfig,
    registry: Arc<ConnectionRegistry>,
    pending_rpc: Mutex<HashMap<String, PendingRpc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("rpc request timed out")]
    Timeout,
    #[error("no connections available for the target channel")]
    NoConnections,
}

impl ChannelManager {
    pub fn new(registry: Arc<ConnectionRegistry>, config: ChannelManagerConfig) -> Arc<Self> {
        let manager = Arc::new(Self {
            channels: RwLock::new(HashMap::new()),
            config,
            registry,
            pending_rpc: Mutex::new(HashMap::new()),
        });
        let reap_manager = manager.clone();
        tokio::spawn(async move { reap_expired_rpc(reap_manager).await });
        manager
    }

    pub async fn create_channel(&self, channel_id: &str, config: Option<ChannelConfig>) -> Arc<Channel> {
        if let Some(existing) = self.channels.read().await.get(channel_id) {
            return existing.clone();
        }
        let mut channels = self.channels.write().await;
        channels
            .entry(channel_id.to_owned())
            .or_insert_with(|| {
                Arc::new(Channel {
                    channel_id: channel_id.to_owned(),
                    config: config.unwrap_or_else(|| self.config.default_config.clone()),
                    subscribers: Mutex::new(Vec::new()),
                    recent: Mutex::new(std::collections::VecDeque::new()),
                })
            })
            .clone()
    }

    pub async fn subscribe(&self, conn_id: &str, channel_id: &str) -> SubscribeOutcome {
        let channel = match self.channels.read().await.get(channel_id).cloned() {
            Some(c) => c,
            None if self.config.auto_create => self.create_channel(channel_id, None).await,
            None => {
                return SubscribeOutcome { success: false, reason: Some("channel does not exist".to_owned()) }
            }
        };

        let mut subscribers = channel.subscribers.lock().await;
        if let Some(max) = channel.config.max_subscribers {
            if subscribers.len() >= max && !subscribers.iter().any(|c| c == conn_id) {
                return SubscribeOutcome { success: false, reason: Some("channel is full".to_owned()) };
            }
        }
        if !subscribers.iter().any(|c| c == conn_id) {
            subscribers.push(conn_id.to_owned());
        }
        drop(subscribers);

        if let Some(conn) = self.registry.get(conn_id).await {
            conn.subscriptions.lock().unwrap().insert(channel_id.to_owned());
        }
        SubscribeOutcome { success: true, reason: None }
    }

    pub async fn unsubscribe(&self, conn_id: &str, channel_id: &str) {
        if let Some(channel) = self.channels.read().await.get(channel_id).cloned() {
            channel.subscribers.lock().await.retain(|c| c != conn_id);
        }
        if let Some(conn) = self.registry.get(conn_id).await {
            conn.subscriptions.lock().unwrap().remove(channel_id);
        }
    }

    pub async fn unsubscribe_all(&self, conn_id: &str) {
        let channel_ids: Vec<String> = self.channels.read().await.keys().cloned().collect();
        for channel_id in channel_ids {
            self.unsubscribe(conn_id, &channel_id).await;
        }
    }

    /// Fan out to every subscriber, excluding the sender iff `exclude_self`.
    /// Best-effort: a write failure to one subscriber never affects others.
    pub async fn publish(&self, channel_id: &str, data: Value, sender: Option<&str>, exclude_self: bool) -> PublishOutcome {
        let Some(channel) = self.channels.read().await.get(channel_id).cloned() else {
            return PublishOutcome { success: false, delivered_to: 0 };
        };

        {
            let mut recent = channel.recent.lock().await;
            if recent.len() >= channel.config.message_retention.max(1) {
                recent.pop_front();
            }
            recent.push_back(data.clone());
        }

        // `sender` identifies the publisher by conn_id (for the exclude_self
        // comparison below); the wire `from` field is the publisher's uid.
        let mut sender_uid = None;
        if let Some(sender_conn_id) = sender {
            if let Some(conn) = self.registry.get(sender_conn_id).await {
                sender_uid = conn.uid.lock().unwrap().clone();
            }
        }

        let subscribers = channel.subscribers.lock().await.clone();
        let mut delivered = 0;
        for conn_id in &subscribers {
            if exclude_self && sender == Some(conn_id.as_str()) {
                continue;
            }
            let Some(conn) = self.registry.get(conn_id).await else { continue };
            let msg = ChannelMsg {
                channel_id: channel_id.to_owned(),
                data: data.clone(),
                from: sender_uid.clone(),
            };
            let event = msg.to_event();
            let wire = sente_protocol::encode_event(&event.id, event.data);
            if let Ok(bytes) = sente_protocol::JsonCodec.encode(&wire) {
                if matches!(conn.outbound.enqueue(bytes), sente_queue::EnqueueResult::Ok) {
                    delivered += 1;
                }
            }
        }
        PublishOutcome { success: true, delivered_to: delivered }
    }

    pub async fn list_channels(&self) -> HashMap<String, ChannelInfo> {
        let mut out = HashMap::new();
        for (id, channel) in self.channels.read().await.iter() {
            out.insert(
                id.clone(),
                ChannelInfo {
                    subscriber_count: channel.subscribers.lock().await.len(),
                    config: channel.config.clone(),
                },
            );
        }
        out
    }

    /// Allocate a request-id, publish the annotated event to the channel,
    /// and await the correlated `send_rpc_response` (or time out).
    pub async fn send_rpc_request(
        self: &Arc<Self>,
        channel_id: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending_rpc.lock().await.insert(
            request_id.clone(),
            PendingRpc { reply_tx: tx, deadline: Instant::now() + timeout },
        );

        let mut annotated = data;
        if let Value::Object(map) = &mut annotated {
            map.insert("request-id".to_owned(), Value::String(request_id.clone()));
        }
        let outcome = self.publish(channel_id, annotated, None, false).await;
        if outcome.delivered_to == 0 {
            self.pending_rpc.lock().await.remove(&request_id);
            return Err(RpcError::NoConnections);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            _ => {
                self.pending_rpc.lock().await.remove(&request_id);
                Err(RpcError::Timeout)
            }
        }
    }

    /// Correlate a reply to a pending RPC request; returns whether a
    /// waiter was actually found (a late reply after timeout is a no-op).
    pub async fn send_rpc_response(&self, request_id: &str, data: Value) -> bool {
        if let Some(pending) = self.pending_rpc.lock().await.remove(request_id) {
            let _ = pending.reply_tx.send(data);
            true
        } else {
            false
        }
    }
}

async fn reap_expired_rpc(manager: Arc<ChannelManager>) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;
        let now = Instant::now();
        manager.pending_rpc.lock().await.retain(|_, pending| pending.deadline > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribe_then_publish_delivers_to_subscriber_not_sender_when_excluded() {
        let registry = Arc::new(ConnectionRegistry::new());
        let manager = ChannelManager::new(registry.clone(), ChannelManagerConfig::default());

        let a = ConnectionRegistry::allocate_conn_id();
        let b = ConnectionRegistry::allocate_conn_id();
        registry.accept(a.clone(), 16).await;
        registry.accept(b.clone(), 16).await;

        assert!(manager.subscribe(&a, "room-1").await.success);
        assert!(manager.subscribe(&b, "room-1").await.success);

        let outcome = manager.publish("room-1", json!({"msg": "hi"}), Some(&a), true).await;
        assert_eq!(outcome.delivered_to, 1);

        let conn_b = registry.get(&b).await.unwrap();
        assert_eq!(conn_b.outbound.stats().enqueued, 1);
        let conn_a = registry.get(&a).await.unwrap();
        assert_eq!(conn_a.outbound.stats().enqueued, 0);
    }

    #[tokio::test]
    async fn subscribe_rejects_once_channel_is_full() {
        let registry = Arc::new(ConnectionRegistry::new());
        let manager = ChannelManager::new(registry.clone(), ChannelManagerConfig::default());
        manager.create_channel("limited", Some(ChannelConfig { max_subscribers: Some(1), message_retention: 4 })).await;

        let a = ConnectionRegistry::allocate_conn_id();
        let b = ConnectionRegistry::allocate_conn_id();
        registry.accept(a.clone(), 16).await;
        registry.accept(b.clone(), 16).await;

        assert!(manager.subscribe(&a, "limited").await.success);
        let rejected = manager.subscribe(&b, "limited").await;
        assert!(!rejected.success);
        assert!(rejected.reason.is_some());
    }

    #[tokio::test]
    async fn rpc_request_times_out_without_a_response() {
        let registry = Arc::new(ConnectionRegistry::new());
        let manager = ChannelManager::new(registry.clone(), ChannelManagerConfig::default());
        let a = ConnectionRegistry::allocate_conn_id();
        registry.accept(a.clone(), 16).await;
        manager.subscribe(&a, "rpc-room").await;

        let result = manager.send_rpc_request("rpc-room", json!({"op": "ping"}), Duration::from_millis(30)).await;
        assert!(matches!(result, Err(RpcError::Timeout)));
    }
}

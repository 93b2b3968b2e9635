//! sente-client: the WebSocket client runtime.
//!
//! Owns one logical connection to a sente-lite server: a state machine
//! (`closed → connecting → open → reconnecting → …`), a send queue, and a
//! dispatcher for application events. System events (handshake, heartbeat,
//! RPC replies, push unwrapping) are consumed inline; everything else is
//! handed to both `on_message` and the dispatcher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use sente_dispatch::{Dispatcher, HandlerId, OffTarget, OnOptions, Outcome};
use sente_protocol::{channel, system, Codec, Event, EventId, JsonCodec};
use sente_queue::SendQueue;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio_tungstenite::tungstenite::protocol::Message;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("send queue rejected the message")]
    QueueRejected,
    #[error("request timed out waiting for a reply")]
    RpcTimeout,
    #[error("client is closed")]
    Closed,
    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type OnOpen = Arc<dyn Fn(String) + Send + Sync>;
pub type OnReconnect = Arc<dyn Fn() + Send + Sync>;
pub type OnMessage = Arc<dyn Fn(EventId, Value) + Send + Sync>;
pub type OnClose = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Clone)]
pub struct ClientConfig {
    pub url: String,
    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub reconnect_jitter: bool,
    pub max_reconnect_attempts: Option<u32>,
    pub send_queue_depth: usize,
    pub flush_interval: Duration,
    pub on_open: Option<OnOpen>,
    pub on_reconnect: Option<OnReconnect>,
    pub on_message: Option<OnMessage>,
    pub on_close: Option<OnClose>,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auto_reconnect: true,
            reconnect_delay: Duration::from_millis(500),
            max_reconnect_delay: Duration::from_secs(30),
            reconnect_jitter: true,
            max_reconnect_attempts: None,
            send_queue_depth: 256,
            flush_interval: Duration::from_millis(50),
            on_open: None,
            on_reconnect: None,
            on_message: None,
            on_close: None,
        }
    }
}

struct Shared {
    queue: SendQueue,
    dispatcher: Dispatcher,
    codec: JsonCodec,
    state_tx: watch::Sender<system::ConnectionState>,
    uid: Mutex<Option<String>>,
    rpc_table: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    shutdown_tx: watch::Sender<bool>,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    last_pong_at: Mutex<std::time::Instant>,
}

impl Shared {
    fn set_state(&self, state: system::ConnectionState) {
        let _ = self.state_tx.send(state);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ClientStats {
    pub messages_sent: u64,
    pub messages_received: u64,
}

/// A handle to a running client. Cloning shares the same connection.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Allocate a client and start its connection loop in the background.
    pub fn make_client(config: ClientConfig) -> Self {
        let (state_tx, _) = watch::channel(system::ConnectionState::Closed);
        let (shutdown_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            queue: SendQueue::new(config.send_queue_depth),
            dispatcher: Dispatcher::new(128),
            codec: JsonCodec,
            state_tx,
            uid: Mutex::new(None),
            rpc_table: Mutex::new(HashMap::new()),
            shutdown_tx,
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            last_pong_at: Mutex::new(std::time::Instant::now()),
        });

        let run_shared = shared.clone();
        let run_config = config;
        tokio::spawn(async move { run_connection_loop(run_shared, run_config).await });

        Self { shared }
    }

    pub fn state(&self) -> system::ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn uid(&self) -> Option<String> {
        self.shared.uid.lock().unwrap().clone()
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            messages_sent: self.shared.messages_sent.load(Ordering::Relaxed),
            messages_received: self.shared.messages_received.load(Ordering::Relaxed),
        }
    }

    pub fn queue_stats(&self) -> sente_queue::QueueStats {
        self.shared.queue.stats()
    }

    /// Register an application handler; forwarded to the client's dispatcher.
    pub fn on(&self, opts: OnOptions, callback: impl Fn(Outcome) + Send + Sync + 'static) -> HandlerId {
        self.shared.dispatcher.on(opts, callback)
    }

    pub fn off(&self, target: OffTarget) -> bool {
        self.shared.dispatcher.off(target)
    }

    /// Encode and enqueue an event; non-blocking.
    pub fn send(&self, event: Event) -> Result<(), ClientError> {
        let wire = sente_protocol::encode_event(&event.id, event.data);
        let bytes = self
            .shared
            .codec
            .encode(&wire)
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        match self.shared.queue.enqueue(bytes) {
            sente_queue::EnqueueResult::Ok => {
                self.shared.messages_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            sente_queue::EnqueueResult::Rejected => Err(ClientError::QueueRejected),
        }
    }

    /// Send a callback-wrapped event and await the correlated `chsk/reply`.
    pub async fn request(&self, event: Event, timeout: Duration) -> Result<Value, ClientError> {
        let (wire, cb_uuid) = sente_protocol::encode_event_with_callback(&event.id, event.data, None);
        let (tx, rx) = oneshot::channel();
        self.shared.rpc_table.lock().unwrap().insert(cb_uuid.clone(), tx);

        let bytes = self
            .shared
            .codec
            .encode(&wire)
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        if let sente_queue::EnqueueResult::Rejected = self.shared.queue.enqueue(bytes) {
            self.shared.rpc_table.lock().unwrap().remove(&cb_uuid);
            return Err(ClientError::QueueRejected);
        }
        self.shared.messages_sent.fetch_add(1, Ordering::Relaxed);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                self.shared.rpc_table.lock().unwrap().remove(&cb_uuid);
                Err(ClientError::RpcTimeout)
            }
        }
    }

    /// `subscribe!` — send the subscribe event and await the matching
    /// `sente-lite/subscribed` confirmation for this channel specifically.
    pub async fn subscribe(&self, channel_id: impl Into<String>, timeout: Duration) -> Result<channel::Subscribed, ClientError> {
        let channel_id = channel_id.into();
        let event = channel::Subscribe { channel_id: channel_id.clone(), data: None }.to_event();

        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let expected = channel_id.clone();
        let predicate = move |ev: &Event| {
            ev.id == channel::subscribed_id() && ev.data.get("channel-id").and_then(Value::as_str) == Some(expected.as_str())
        };
        self.shared.dispatcher.on(OnOptions::custom(predicate).once().timeout(timeout), move |outcome| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(outcome);
            }
        });

        self.send(event)?;

        match rx.await {
            Ok(Outcome::Message(ev)) => channel::Subscribed::from_data(&ev.data)
                .ok_or_else(|| ClientError::Protocol("malformed sente-lite/subscribed payload".to_owned())),
            Ok(Outcome::Timeout) => Err(ClientError::RpcTimeout),
            Ok(Outcome::Closed(_)) | Err(_) => Err(ClientError::Closed),
        }
    }

    pub fn unsubscribe(&self, channel_id: impl Into<String>) -> Result<(), ClientError> {
        self.send(channel::Unsubscribe { channel_id: channel_id.into() }.to_event())
    }

    pub fn publish(&self, channel_id: impl Into<String>, data: Value) -> Result<(), ClientError> {
        self.send(channel::Publish { channel_id: channel_id.into(), data }.to_event())
    }

    /// Prevent further reconnects and drain gracefully.
    pub fn close(&self) {
        let _ = self.shared.shutdown_tx.send(true);
    }
}

async fn run_connection_loop(shared: Arc<Shared>, config: ClientConfig) {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    let mut attempt: u32 = 0;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        shared.set_state(system::ConnectionState::Connecting);
        match tokio_tungstenite::connect_async(&config.url).await {
            Ok((ws_stream, _response)) => {
                attempt = 0;
                shared.set_state(system::ConnectionState::Open);
                run_open_connection(&shared, &config, ws_stream, &mut shutdown_rx).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, url = %config.url, "sente-client connect failed");
            }
        }

        if *shutdown_rx.borrow() {
            break;
        }
        if !config.auto_reconnect {
            break;
        }
        attempt += 1;
        if config.max_reconnect_attempts.is_some_and(|max| attempt > max) {
            tracing::warn!(attempt, "sente-client giving up reconnecting");
            break;
        }

        shared.set_state(system::ConnectionState::Reconnecting);
        let delay = backoff_delay(&config, attempt);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    let (stats, buffered) = shared.dispatcher.close("client-closed");
    tracing::debug!(matched = stats.matched, buffered = buffered.len(), "dispatcher closed");
    shared.set_state(system::ConnectionState::Closed);
    if let Some(hook) = &config.on_close {
        hook("closed".to_owned());
    }
}

fn backoff_delay(config: &ClientConfig, attempt: u32) -> Duration {
    let base_ms = config.reconnect_delay.as_millis() as u64;
    let cap_ms = config.max_reconnect_delay.as_millis() as u64;
    let factor = 1u64.checked_shl(attempt.saturating_sub(1).min(62)).unwrap_or(u64::MAX);
    let doubled = base_ms.saturating_mul(factor).min(cap_ms).max(1);
    if !config.reconnect_jitter {
        return Duration::from_millis(doubled);
    }
    let jitter_span = (doubled / 2).max(1);
    let jittered = doubled - jitter_span / 2 + rand::random::<u64>() % jitter_span;
    Duration::from_millis(jittered.max(1))
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn run_open_connection(
    shared: &Arc<Shared>,
    config: &ClientConfig,
    ws_stream: WsStream,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let (ws_sink, mut ws_read) = ws_stream.split();

    let flusher = shared.queue.spawn_flusher(
        TextSink { inner: ws_sink },
        config.flush_interval,
        |err: &tokio_tungstenite::tungstenite::Error, _msg| {
            tracing::warn!(error = %err, "sente-client write failed");
        },
    );

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            frame = ws_read.next() => {
                match frame {
                    None => break,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "sente-client read error");
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound_bytes(shared, config, text.as_bytes());
                    }
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    flusher.stop().await;
}

struct TextSink {
    inner: futures_util::stream::SplitSink<WsStream, Message>,
}

impl futures_util::Sink<Vec<u8>> for TextSink {
    type Error = tokio_tungstenite::tungstenite::Error;

    fn poll_ready(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::pin::Pin::new(&mut self.inner).poll_ready(cx)
    }

    fn start_send(mut self: std::pin::Pin<&mut Self>, item: Vec<u8>) -> Result<(), Self::Error> {
        let text = String::from_utf8_lossy(&item).into_owned();
        std::pin::Pin::new(&mut self.inner).start_send(Message::Text(text.into()))
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::pin::Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_close(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::pin::Pin::new(&mut self.inner).poll_close(cx)
    }
}

fn handle_inbound_bytes(shared: &Arc<Shared>, config: &ClientConfig, bytes: &[u8]) {
    match sente_protocol::decode_inbound(bytes, &shared.codec) {
        Ok(sente_protocol::DecodedInbound::Single(event)) => handle_inbound_event(shared, config, event),
        Ok(sente_protocol::DecodedInbound::Batch(events)) => {
            for event in events {
                handle_inbound_event(shared, config, event);
            }
        }
        Ok(sente_protocol::DecodedInbound::CallbackWrapped { event, .. }) => {
            handle_inbound_event(shared, config, event);
        }
        Err(e) => {
            tracing::warn!(error = %e, "sente-client failed to decode inbound frame");
        }
    }
}

fn handle_inbound_event(shared: &Arc<Shared>, config: &ClientConfig, event: Event) {
    if event.id == system::ws_ping_id() {
        let _ = send_system(shared, system::ws_pong_event());
        return;
    }
    if event.id == system::ws_pong_id() {
        *shared.last_pong_at.lock().unwrap() = std::time::Instant::now();
        return;
    }
    if event.id == system::handshake_id() {
        if let Some(hs) = system::Handshake::from_data(&event.data) {
            *shared.uid.lock().unwrap() = Some(hs.uid.clone());
            if hs.first {
                if let Some(hook) = &config.on_open {
                    hook(hs.uid);
                }
            } else if let Some(hook) = &config.on_reconnect {
                hook();
            }
        }
        return;
    }
    if event.id == system::reply_id() {
        if let Some(reply) = system::Reply::from_data(&event.data) {
            if let Some(tx) = shared.rpc_table.lock().unwrap().remove(&reply.cb_uuid) {
                let _ = tx.send(reply.data);
            }
        }
        return;
    }

    let event = system::unwrap_recv(&event).unwrap_or(event);
    shared.messages_received.fetch_add(1, Ordering::Relaxed);
    if let Some(hook) = &config.on_message {
        hook(event.id.clone(), event.data.clone());
    }
    shared.dispatcher.dispatch(event);
}

fn send_system(shared: &Arc<Shared>, event: Event) -> Result<(), ClientError> {
    let wire = sente_protocol::encode_event(&event.id, event.data);
    let bytes = shared.codec.encode(&wire).map_err(|e| ClientError::Protocol(e.to_string()))?;
    match shared.queue.enqueue(bytes) {
        sente_queue::EnqueueResult::Ok => Ok(()),
        sente_queue::EnqueueResult::Rejected => Err(ClientError::QueueRejected),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delay_doubles_and_caps_at_max() {
        let mut config = ClientConfig::new("ws://localhost:0");
        config.reconnect_jitter = false;
        config.reconnect_delay = Duration::from_millis(100);
        config.max_reconnect_delay = Duration::from_millis(800);

        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&config, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(&config, 3), Duration::from_millis(400));
        assert_eq!(backoff_delay(&config, 4), Duration::from_millis(800));
        assert_eq!(backoff_delay(&config, 10), Duration::from_millis(800));
    }

    #[test]
    fn backoff_delay_with_jitter_stays_within_bounds() {
        let mut config = ClientConfig::new("ws://localhost:0");
        config.reconnect_jitter = true;
        config.reconnect_delay = Duration::from_millis(100);
        config.max_reconnect_delay = Duration::from_millis(800);

        for attempt in 1..8 {
            let delay = backoff_delay(&config, attempt);
            assert!(delay.as_millis() >= 1);
            assert!(delay.as_millis() <= 800);
        }
    }
}

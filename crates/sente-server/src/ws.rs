//! Server Runtime (spec §4.8): WebSocket upgrade, handshake, per-connection
//! read/write loops, inline system-event handling, and the heartbeat
//! scheduler.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use sente_protocol::{channel, system, Codec, DecodedInbound, Event, JsonCodec};
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::Connection;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(rename = "client-id")]
    client_id: Option<String>,
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>, Query(query): Query<WsQuery>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.client_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, client_id: Option<String>) {
    let conn_id = client_id.unwrap_or_else(crate::registry::ConnectionRegistry::allocate_conn_id);
    let conn = state.registry.accept(conn_id.clone(), state.config.send_queue_depth).await;

    let uid = Uuid::new_v4().to_string();
    state.registry.set_uid(&conn_id, uid.clone()).await;

    let (ws_sink, mut ws_read) = socket.split();

    let handshake = system::Handshake { uid: uid.clone(), csrf_token: None, data: None, first: true }.to_event();
    enqueue_event(&conn, &handshake);

    let flush_conn_id = conn_id.clone();
    let flusher = conn.outbound.spawn_flusher(
        TextSink { inner: ws_sink },
        Duration::from_millis(50),
        move |err: &axum::Error, _msg| {
            warn!(error = %err, conn_id = %flush_conn_id, "sente-server write failed");
        },
    );

    info!(conn_id = %conn.conn_id, uid = %uid, "connection opened");

    let mut decode_errors = 0u32;
    loop {
        tokio::select! {
            biased;
            () = conn.shutdown_requested() => {
                let reason = conn.shutdown_reason().unwrap_or_else(|| "server-closed".to_owned());
                info!(conn_id = %conn.conn_id, reason = %reason, "connection shut down by server");
                break;
            }
            frame = ws_read.next() => {
                match frame {
                    None => break,
                    Some(Err(e)) => {
                        warn!(conn_id = %conn.conn_id, error = %e, "read error");
                        break;
                    }
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Text(text))) => {
                        if !handle_frame(&state, &conn, text.as_bytes()).await {
                            decode_errors += 1;
                            if decode_errors > 10 {
                                warn!(conn_id = %conn.conn_id, "too many decode failures, closing connection");
                                break;
                            }
                        } else {
                            decode_errors = 0;
                        }
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.channels.unsubscribe_all(&conn.conn_id).await;
    state.registry.remove(&conn.conn_id).await;
    flusher.stop().await;
    info!(conn_id = %conn.conn_id, "connection closed");
}

/// Returns `false` on a decode failure (the connection is kept open; the
/// caller tracks a per-connection failure budget).
async fn handle_frame(state: &AppState, conn: &Connection, bytes: &[u8]) -> bool {
    match sente_protocol::decode_inbound(bytes, &JsonCodec) {
        Ok(DecodedInbound::Single(event)) => {
            if let Some(reply) = handle_event(state, conn, event).await {
                deliver_push(state, conn, reply);
            }
            true
        }
        Ok(DecodedInbound::Batch(events)) => {
            for event in events {
                if let Some(reply) = handle_event(state, conn, event).await {
                    deliver_push(state, conn, reply);
                }
            }
            true
        }
        Ok(DecodedInbound::CallbackWrapped { event, cb_uuid }) => {
            let data = handle_event(state, conn, event).await.map(|e| e.data).unwrap_or(serde_json::Value::Null);
            let wrapped = system::Reply { cb_uuid, data }.to_event();
            enqueue_event(conn, &wrapped);
            true
        }
        Err(e) => {
            debug!(conn_id = %conn.conn_id, error = %e, "parse-failed");
            false
        }
    }
}

fn deliver_push(state: &AppState, conn: &Connection, event: Event) {
    let event = if state.config.wrap_recv_evs { system::wrap_recv(&event) } else { event };
    enqueue_event(conn, &event);
}

/// Handles one inbound event. System and extension events are handled
/// inline and never produce a reply value (they enqueue their own
/// responses directly); everything else falls through to the `on_message`
/// hook, or the default echo when no hook is configured.
async fn handle_event(state: &AppState, conn: &Connection, event: Event) -> Option<Event> {
    if event.id == system::ws_ping_id() {
        enqueue_event(conn, &system::ws_pong_event());
        return None;
    }
    if event.id == system::ws_pong_id() {
        conn.touch_pong();
        return None;
    }
    if event.id == channel::subscribe_id() {
        if let Some(sub) = channel::Subscribe::from_data(&event.data) {
            let outcome = state.channels.subscribe(&conn.conn_id, &sub.channel_id).await;
            let reply = channel::Subscribed { channel_id: sub.channel_id, success: outcome.success, error: outcome.reason };
            enqueue_event(conn, &reply.to_event());
        }
        return None;
    }
    if event.id == channel::unsubscribe_id() {
        if let Some(unsub) = channel::Unsubscribe::from_data(&event.data) {
            state.channels.unsubscribe(&conn.conn_id, &unsub.channel_id).await;
        }
        return None;
    }
    if event.id == channel::publish_id() {
        if let Some(publish) = channel::Publish::from_data(&event.data) {
            state
                .channels
                .publish(&publish.channel_id, publish.data, Some(conn.conn_id.as_str()), state.config.exclude_self_on_publish)
                .await;
        }
        return None;
    }

    match &state.on_message {
        Some(hook) => hook(&conn.conn_id, &event.id, &event.data),
        None => Some(channel::Echo { original_event_id: event.id.as_str().to_owned(), original_data: event.data.clone() }.to_event()),
    }
}

fn enqueue_event(conn: &Connection, event: &Event) {
    let wire = sente_protocol::encode_event(&event.id, event.data.clone());
    if let Ok(bytes) = JsonCodec.encode(&wire) {
        let _ = conn.outbound.enqueue(bytes);
    }
}

struct TextSink {
    inner: futures_util::stream::SplitSink<WebSocket, Message>,
}

impl futures_util::Sink<Vec<u8>> for TextSink {
    type Error = axum::Error;

    fn poll_ready(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        std::pin::Pin::new(&mut self.inner).poll_ready(cx)
    }

    fn start_send(mut self: std::pin::Pin<&mut Self>, item: Vec<u8>) -> Result<(), Self::Error> {
        let text = String::from_utf8_lossy(&item).into_owned();
        std::pin::Pin::new(&mut self.inner).start_send(Message::Text(text.into()))
    }

    fn poll_flush(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        std::pin::Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_close(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        std::pin::Pin::new(&mut self.inner).poll_close(cx)
    }
}

/// Pings every open connection on `ping_interval` and removes any
/// connection whose last pong predates `heartbeat_timeout`.
pub async fn run_heartbeat_scheduler(state: AppState) {
    if !state.config.heartbeat_enabled {
        return;
    }
    let mut interval = tokio::time::interval(state.config.ping_interval);
    loop {
        interval.tick().await;
        let snapshot = state.registry.list().await;
        for entry in snapshot {
            let Some(conn) = state.registry.get(&entry.conn_id).await else { continue };
            if conn.is_stale(state.config.heartbeat_timeout) {
                warn!(conn_id = %entry.conn_id, "heartbeat-timeout, closing connection");
                conn.request_shutdown("heartbeat-timeout");
                continue;
            }
            enqueue_event(&conn, &system::ws_ping_event());
        }
    }
}

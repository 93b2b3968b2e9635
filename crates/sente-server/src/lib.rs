//! sente-server: the WebSocket half of the sente-lite real-time messaging
//! runtime. A thin axum router wraps a [`registry::ConnectionRegistry`] and
//! a [`channels::ChannelManager`]; see [`ws`] for the per-connection loop.

pub mod channels;
pub mod registry;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use channels::{ChannelManager, ChannelManagerConfig};
use registry::ConnectionRegistry;

/// A handler for application events that don't match a reserved
/// `chsk`/`sente-lite` event-id. Returning `None` sends no reply.
pub type OnMessage = Arc<dyn Fn(&str, &sente_protocol::EventId, &Value) -> Option<sente_protocol::Event> + Send + Sync>;

#[derive(Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub send_queue_depth: usize,
    pub heartbeat_enabled: bool,
    pub ping_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub wrap_recv_evs: bool,
    pub exclude_self_on_publish: bool,
    pub channel_defaults: channels::ChannelConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            send_queue_depth: 256,
            heartbeat_enabled: true,
            ping_interval: Duration::from_secs(20),
            heartbeat_timeout: Duration::from_secs(60),
            wrap_recv_evs: false,
            exclude_self_on_publish: true,
            channel_defaults: channels::ChannelConfig::default(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub channels: Arc<ChannelManager>,
    pub config: Arc<ServerConfig>,
    pub on_message: Option<OnMessage>,
}

impl AppState {
    pub fn new(config: ServerConfig, on_message: Option<OnMessage>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let channels = ChannelManager::new(
            registry.clone(),
            ChannelManagerConfig { auto_create: true, default_config: config.channel_defaults.clone() },
        );
        Self { registry, channels, config: Arc::new(config), on_message }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/chsk", get(ws::ws_handler))
        .route("/healthz", get(healthz))
        .route("/stats", get(stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn stats(axum::extract::State(state): axum::extract::State<AppState>) -> Json<Value> {
    let active_connections = state.registry.active_count().await;
    let channels = state.channels.list_channels().await;
    Json(json!({
        "active-connections": active_connections,
        "channels": channels.into_iter().map(|(id, info)| {
            json!({"channel-id": id, "subscriber-count": info.subscriber_count})
        }).collect::<Vec<_>>(),
        "directory": state.registry.directory_snapshot().await,
    }))
}

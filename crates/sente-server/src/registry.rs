//! Connection Registry (spec §4.6): per-connection server-side state, id
//! allocation, and a small observability directory other layers can read.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use sente_queue::SendQueue;
use serde_json::{json, Value};
use tokio::sync::{Notify, RwLock};
use uuid::Uuid;

pub struct Connection {
    pub conn_id: String,
    pub uid: std::sync::Mutex<Option<String>>,
    pub opened_at: Instant,
    pub last_pong_at: std::sync::Mutex<Instant>,
    pub subscriptions: std::sync::Mutex<std::collections::HashSet<String>>,
    pub outbound: SendQueue,
    shutdown: Notify,
    shutdown_reason: std::sync::Mutex<Option<String>>,
}

impl Connection {
    fn new(conn_id: String, outbound_depth: usize) -> Self {
        let now = Instant::now();
        Self {
            conn_id,
            uid: std::sync::Mutex::new(None),
            opened_at: now,
            last_pong_at: std::sync::Mutex::new(now),
            subscriptions: std::sync::Mutex::new(std::collections::HashSet::new()),
            outbound: SendQueue::new(outbound_depth),
            shutdown: Notify::new(),
            shutdown_reason: std::sync::Mutex::new(None),
        }
    }

    pub fn touch_pong(&self) {
        *self.last_pong_at.lock().unwrap() = Instant::now();
    }

    pub fn is_stale(&self, liveness_threshold: std::time::Duration) -> bool {
        self.last_pong_at.lock().unwrap().elapsed() > liveness_threshold
    }

    /// Signals the connection's read loop to tear down the socket. Uses
    /// `notify_one` (not `notify_waiters`) so the signal is not lost if it
    /// arrives before the read loop's select! starts waiting.
    pub fn request_shutdown(&self, reason: impl Into<String>) {
        *self.shutdown_reason.lock().unwrap() = Some(reason.into());
        self.shutdown.notify_one();
    }

    /// Resolves once `request_shutdown` has been called.
    pub async fn shutdown_requested(&self) {
        self.shutdown.notified().await;
    }

    pub fn shutdown_reason(&self) -> Option<String> {
        self.shutdown_reason.lock().unwrap().clone()
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub conn_id: String,
    pub uid: Option<String>,
    pub opened_at_ms: u128,
}

pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    directory: RwLock<HashMap<String, Value>>,
    epoch: Instant,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            directory: RwLock::new(HashMap::new()),
            epoch: Instant::now(),
        }
    }

    pub fn allocate_conn_id() -> String {
        Uuid::new_v4().to_string()
    }

    pub async fn accept(&self, conn_id: String, outbound_depth: usize) -> Arc<Connection> {
        let conn = Arc::new(Connection::new(conn_id.clone(), outbound_depth));
        self.connections.write().await.insert(conn_id.clone(), conn.clone());
        self.directory.write().await.insert(
            format!("connections/{conn_id}"),
            json!({"conn-id": conn_id, "uid": Value::Null, "opened-at": conn.opened_at.duration_since(self.epoch).as_millis() as u64}),
        );
        conn
    }

    pub async fn set_uid(&self, conn_id: &str, uid: String) {
        if let Some(conn) = self.connections.read().await.get(conn_id) {
            *conn.uid.lock().unwrap() = Some(uid.clone());
        }
        if let Some(entry) = self.directory.write().await.get_mut(&format!("connections/{conn_id}")) {
            entry["uid"] = json!(uid);
        }
    }

    pub async fn remove(&self, conn_id: &str) -> Option<Arc<Connection>> {
        self.directory.write().await.remove(&format!("connections/{conn_id}"));
        self.connections.write().await.remove(conn_id)
    }

    pub async fn get(&self, conn_id: &str) -> Option<Arc<Connection>> {
        self.connections.read().await.get(conn_id).cloned()
    }

    /// Snapshot ordered newest-first by `opened_at`.
    pub async fn list(&self) -> Vec<ConnectionSnapshot> {
        let mut snapshots: Vec<ConnectionSnapshot> = self
            .connections
            .read()
            .await
            .values()
            .map(|conn| ConnectionSnapshot {
                conn_id: conn.conn_id.clone(),
                uid: conn.uid.lock().unwrap().clone(),
                opened_at_ms: conn.opened_at.duration_since(self.epoch).as_millis(),
            })
            .collect();
        snapshots.sort_by(|a, b| b.opened_at_ms.cmp(&a.opened_at_ms));
        snapshots
    }

    pub async fn active_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn directory_snapshot(&self) -> HashMap<String, Value> {
        self.directory.read().await.clone()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

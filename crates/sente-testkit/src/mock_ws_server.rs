// A real sente-server bound to a random port, for integration tests that
// exercise the wire contract or the client runtime end-to-end.

use std::net::SocketAddr;

use sente_server::{build_router, AppState, OnMessage, ServerConfig};

/// Spins up the real server on `127.0.0.1:0` in a background task and
/// exposes the bound address plus the shared [`AppState`] for assertions
/// (subscriber counts, connection counts, the directory snapshot).
pub struct MockWsServer {
    addr: SocketAddr,
    pub state: AppState,
    _task: tokio::task::JoinHandle<()>,
    _heartbeat: tokio::task::JoinHandle<()>,
}

impl MockWsServer {
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        Self::start_with(ServerConfig::default(), None).await
    }

    pub async fn start_with(mut config: ServerConfig, on_message: Option<OnMessage>) -> Result<Self, Box<dyn std::error::Error>> {
        config.bind_addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let state = AppState::new(config, on_message);
        let listener = tokio::net::TcpListener::bind(state.config.bind_addr).await?;
        let addr = listener.local_addr()?;

        let router = build_router(state.clone());
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        let heartbeat_state = state.clone();
        let heartbeat = tokio::spawn(async move {
            sente_server::ws::run_heartbeat_scheduler(heartbeat_state).await;
        });

        Ok(Self { addr, state, _task: task, _heartbeat: heartbeat })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/chsk", self.addr)
    }
}

//! Binds `/chsk` on :8080 and lets `sente-server`'s default echo reply
//! handle everything: connect a client and send it any namespaced event.

use sente_server::{build_router, AppState, ServerConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::default();
    let bind_addr = config.bind_addr;
    let state = AppState::new(config, None);

    tokio::spawn(sente_server::ws::run_heartbeat_scheduler(state.clone()));

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(%bind_addr, "echo-server listening on /chsk");
    axum::serve(listener, router).await?;
    Ok(())
}

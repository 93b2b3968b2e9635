//! Connects to a sente-lite server, subscribes to a channel, prints any
//! push it receives, and sends one callback-wrapped request.

use std::time::Duration;

use sente_client::{Client, ClientConfig};
use sente_dispatch::{OnOptions, Outcome};
use sente_protocol::event_id;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let url = std::env::args().nth(1).unwrap_or_else(|| "ws://127.0.0.1:8080/chsk".to_owned());

    let mut config = ClientConfig::new(url);
    config.on_open = Some(std::sync::Arc::new(|uid| tracing::info!(%uid, "connected")));
    config.on_reconnect = Some(std::sync::Arc::new(|| tracing::info!("reconnected")));
    let client = Client::make_client(config);

    client.on(OnOptions::any(), |outcome| {
        if let Outcome::Message(event) = outcome {
            tracing::info!(event_id = %event.id, data = %event.data, "push received");
        }
    });

    tokio::time::sleep(Duration::from_millis(200)).await;

    match client.subscribe("demo-room", Duration::from_secs(5)).await {
        Ok(subscribed) => tracing::info!(?subscribed, "subscribed"),
        Err(e) => tracing::warn!(error = %e, "subscribe failed"),
    }

    let request = sente_protocol::Event::new(event_id!("app", "ping"), serde_json::json!({"n": 1}));
    match client.request(request, Duration::from_secs(5)).await {
        Ok(data) => tracing::info!(%data, "reply received"),
        Err(e) => tracing::warn!(error = %e, "request failed"),
    }

    tokio::signal::ctrl_c().await?;
    client.close();
    Ok(())
}

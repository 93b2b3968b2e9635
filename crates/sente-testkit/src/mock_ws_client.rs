use futures_util::{SinkExt, StreamExt};
use sente_protocol::{decode_value, Codec, DecodedInbound, Event, EventId, JsonCodec};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::MaybeTlsStream;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// A raw wire-level client: speaks the sente-lite JSON frame format
/// directly over a `tokio-tungstenite` connection, bypassing `sente-client`
/// entirely. Useful for exercising `sente-server`'s wire contract without
/// also depending on the client runtime's correctness.
pub struct MockWsClient {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
}

impl MockWsClient {
    pub async fn connect(url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    pub async fn send_event(&mut self, id: &EventId, data: serde_json::Value) -> Result<(), Box<dyn std::error::Error>> {
        let wire = sente_protocol::encode_event(id, data);
        let bytes = JsonCodec.encode(&wire)?;
        let text = String::from_utf8(bytes)?;
        self.write.send(Message::Text(text.into())).await?;
        Ok(())
    }

    pub async fn send_raw(&mut self, value: serde_json::Value) -> Result<(), Box<dyn std::error::Error>> {
        let bytes = JsonCodec.encode(&value)?;
        let text = String::from_utf8(bytes)?;
        self.write.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Returns the next inbound frame, skipping WS-protocol ping/pong
    /// frames (those are transport-level, distinct from `chsk/ws-ping`).
    pub async fn recv_event(&mut self) -> Result<Event, Box<dyn std::error::Error>> {
        loop {
            match self.recv_decoded().await? {
                DecodedInbound::Single(event) => return Ok(event),
                DecodedInbound::CallbackWrapped { event, .. } => return Ok(event),
                DecodedInbound::Batch(mut events) if !events.is_empty() => return Ok(events.remove(0)),
                DecodedInbound::Batch(_) => continue,
            }
        }
    }

    pub async fn recv_decoded(&mut self) -> Result<DecodedInbound, Box<dyn std::error::Error>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => {
                    let value: serde_json::Value = serde_json::from_str(&text)?;
                    return Ok(decode_value(value)?);
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => return Err("connection closed by server".into()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}

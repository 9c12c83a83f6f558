//! End-to-end tests: a real server on an OS-assigned port and
//! `tokio-tungstenite` clients.

use std::net::SocketAddr;
use std::time::Duration;

use chatwire::prelude::*;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

type ClientWs = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

// =========================================================================
// Harness
// =========================================================================

struct TestServer {
    addr: SocketAddr,
    handle: ServerHandle,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), ChatwireError>>,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(ConnectionConfig::default()).await
    }

    async fn start_with(config: ConnectionConfig) -> Self {
        let channels = InMemoryChannels::new();
        for name in ["general", "random"] {
            channels.create(name).await;
            for user in ["u-1", "u-2"] {
                channels.add_member(&ChannelId::from(name), user).await.unwrap();
            }
        }
        let tokens = StaticTokens::new()
            .with_token("alice-token", "u-1", "alice")
            .with_token("bob-token", "u-2", "bob")
            .with_token("mallory-token", "u-9", "mallory");

        let server = ChatwireServer::builder()
            .bind("127.0.0.1:0")
            .connection_config(config)
            .build(tokens, channels, InMemoryMessages::new(), TracingAudit::new())
            .await
            .expect("server should bind");
        let addr = server.local_addr().unwrap();
        let handle = server.handle();

        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async {
            let _ = stopped.await;
        }));

        Self {
            addr,
            handle,
            stop: Some(stop),
            task,
        }
    }

    async fn connect(&self, token: &str) -> ClientWs {
        let url = format!("ws://{}/ws?token={token}", self.addr);
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .expect("client should connect");
        ws
    }

    /// Waits until the hub has `n` live connections.
    async fn wait_for_connections(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.handle.hub().connection_count().await != n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connection count should settle");
    }

    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.task.await.unwrap().unwrap();
    }
}

async fn send(ws: &mut ClientWs, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

/// Next data frame as JSON, skipping control frames.
async fn recv(ws: &mut ClientWs) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("should receive within 5s")
            .expect("stream should be open")
            .expect("frame should be valid");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected a text frame, got {other:?}"),
        }
    }
}

/// Waits for the server's close frame and returns its code.
async fn recv_close(ws: &mut ClientWs) -> CloseCode {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("should receive within 5s");
        match msg {
            Some(Ok(Message::Close(Some(frame)))) => return frame.code,
            Some(Ok(Message::Close(None))) | None => panic!("closed without a close frame"),
            Some(Ok(_)) => continue,
            Some(Err(e)) => panic!("read failed: {e}"),
        }
    }
}

async fn join(ws: &mut ClientWs, channel: &str) {
    send(ws, json!({ "type": "join", "data": { "channel_id": channel } })).await;
    let confirmation = recv(ws).await;
    assert_eq!(confirmation["type"], "join");
    assert_eq!(confirmation["data"]["channel_id"], channel);
}

// =========================================================================
// Tests
// =========================================================================

#[tokio::test]
async fn test_chat_is_relayed_to_every_channel_member() {
    let server = TestServer::start().await;
    let mut alice = server.connect("alice-token").await;
    let mut bob = server.connect("bob-token").await;

    join(&mut alice, "general").await;
    join(&mut bob, "general").await;
    let presence = recv(&mut alice).await;
    assert_eq!(presence["type"], "join");
    assert_eq!(presence["data"]["username"], "bob");

    send(
        &mut alice,
        json!({ "type": "chat", "data": { "channel_id": "general", "content": "hi bob", "nonce": "n-1" } }),
    )
    .await;

    let to_bob = recv(&mut bob).await;
    let to_alice = recv(&mut alice).await;
    assert_eq!(to_bob["type"], "chat");
    assert_eq!(to_bob["data"]["content"], "hi bob");
    assert_eq!(to_bob["data"]["sender_name"], "alice");
    assert_eq!(to_bob["message_id"], to_alice["message_id"]);
    assert!(to_bob["timestamp"].is_string());

    let ack = recv(&mut alice).await;
    assert_eq!(ack["type"], "ack");
    assert_eq!(ack["data"]["nonce"], "n-1");
    assert_eq!(ack["data"]["message_id"], to_alice["message_id"]);

    server.stop().await;
}

#[tokio::test]
async fn test_ping_envelope_gets_pong() {
    let server = TestServer::start().await;
    let mut alice = server.connect("alice-token").await;

    send(&mut alice, json!({ "type": "ping" })).await;

    assert_eq!(recv(&mut alice).await["type"], "pong");
    server.stop().await;
}

#[tokio::test]
async fn test_malformed_frame_gets_parse_error_and_connection_survives() {
    let server = TestServer::start().await;
    let mut alice = server.connect("alice-token").await;

    alice.send(Message::text("{nope")).await.unwrap();
    let error = recv(&mut alice).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["data"]["code"], "PARSE_ERROR");

    send(&mut alice, json!({ "type": "ping" })).await;
    assert_eq!(recv(&mut alice).await["type"], "pong");
    server.stop().await;
}

#[tokio::test]
async fn test_chat_to_unjoined_channel_is_rejected() {
    let server = TestServer::start().await;
    let mut alice = server.connect("alice-token").await;

    send(
        &mut alice,
        json!({ "type": "chat", "data": { "channel_id": "general", "content": "hi" } }),
    )
    .await;

    let error = recv(&mut alice).await;
    assert_eq!(error["data"]["code"], "NOT_IN_CHANNEL");
    server.stop().await;
}

#[tokio::test]
async fn test_join_without_membership_is_forbidden() {
    let server = TestServer::start().await;
    let mut mallory = server.connect("mallory-token").await;

    send(&mut mallory, json!({ "type": "join", "data": { "channel_id": "general" } })).await;

    assert_eq!(recv(&mut mallory).await["data"]["code"], "FORBIDDEN");
    server.stop().await;
}

#[tokio::test]
async fn test_invalid_token_is_closed_with_policy_violation() {
    let server = TestServer::start().await;
    let mut ws = server.connect("forged").await;

    assert_eq!(recv_close(&mut ws).await, CloseCode::Policy);
    assert_eq!(server.handle.hub().connection_count().await, 0);
    server.stop().await;
}

#[tokio::test]
async fn test_missing_token_is_refused_before_upgrade() {
    let server = TestServer::start().await;
    let result = tokio_tungstenite::connect_async(format!("ws://{}/ws", server.addr)).await;
    assert!(result.is_err());
    server.stop().await;
}

#[tokio::test]
async fn test_second_connection_replaces_first() {
    let server = TestServer::start().await;
    let mut first = server.connect("alice-token").await;
    server.wait_for_connections(1).await;

    let mut second = server.connect("alice-token").await;

    assert_eq!(recv_close(&mut first).await, CloseCode::Policy);
    send(&mut second, json!({ "type": "ping" })).await;
    assert_eq!(recv(&mut second).await["type"], "pong");
    server.wait_for_connections(1).await;
    server.stop().await;
}

#[tokio::test]
async fn test_disconnect_updates_channel_membership() {
    let server = TestServer::start().await;
    let mut alice = server.connect("alice-token").await;
    let mut bob = server.connect("bob-token").await;
    join(&mut alice, "general").await;
    join(&mut bob, "general").await;
    recv(&mut alice).await;

    let general = ChannelId::from("general");
    assert_eq!(server.handle.hub().channel_member_count(&general).await, 2);

    bob.close(None).await.unwrap();
    server.wait_for_connections(1).await;

    assert_eq!(server.handle.hub().channel_member_count(&general).await, 1);
    let stats = server.handle.hub().stats().await;
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.active_users[0].username, "alice");
    server.stop().await;
}

#[tokio::test]
async fn test_kick_closes_user_connection() {
    let server = TestServer::start().await;
    let mut alice = server.connect("alice-token").await;
    server.wait_for_connections(1).await;

    assert!(server.handle.kick(&UserId::from("u-1")).await);

    assert_eq!(recv_close(&mut alice).await, CloseCode::Policy);
    assert!(!server.handle.kick(&UserId::from("u-1")).await);
    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_clients_with_going_away() {
    let server = TestServer::start().await;
    let mut alice = server.connect("alice-token").await;
    server.wait_for_connections(1).await;
    let hub = server.handle.hub().clone();

    server.stop().await;

    assert_eq!(recv_close(&mut alice).await, CloseCode::Away);
    assert!(hub.is_shut_down().await);
    assert_eq!(hub.connection_count().await, 0);
}

#[tokio::test]
async fn test_silent_client_is_dropped_after_handshake_timeout() {
    let server = TestServer::start_with(ConnectionConfig {
        handshake_timeout: Duration::from_millis(200),
        ..ConnectionConfig::default()
    })
    .await;
    let mut raw = TcpStream::connect(server.addr).await.unwrap();

    let mut buf = [0u8; 64];
    let read = tokio::time::timeout(Duration::from_secs(3), raw.read(&mut buf))
        .await
        .expect("server should drop the socket before 3s");
    assert!(matches!(read, Ok(0) | Err(_)), "expected EOF, got {read:?}");
    assert_eq!(server.handle.hub().connection_count().await, 0);
    server.stop().await;
}

/// An identity service that never answers.
struct Unresponsive;

impl Authenticator for Unresponsive {
    async fn authenticate(&self, _token: &str) -> Result<Identity, AuthError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_stalled_authentication_is_closed_with_try_again() {
    let server = ChatwireServer::builder()
        .bind("127.0.0.1:0")
        .connection_config(ConnectionConfig {
            handshake_timeout: Duration::from_millis(200),
            ..ConnectionConfig::default()
        })
        .build(
            Unresponsive,
            InMemoryChannels::new(),
            InMemoryMessages::new(),
            TracingAudit::new(),
        )
        .await
        .expect("server should bind");
    let addr = server.local_addr().unwrap();
    let hub = server.hub().clone();
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(server.run_until(async {
        let _ = stopped.await;
    }));

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?token=t-1"))
        .await
        .expect("upgrade should succeed before authentication");

    assert_eq!(recv_close(&mut ws).await, CloseCode::Again);
    assert_eq!(hub.connection_count().await, 0);

    let _ = stop.send(());
    task.await.unwrap().unwrap();
}

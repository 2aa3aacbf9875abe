//! End-to-end scenarios over real TCP sockets.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use courier::auth::{InMemoryUserRepository, StaticTokenVerifier, User};
use courier::config::TcpConfig;
use courier::net::{ConnectionManager, MessageHandler, TcpServer};
use courier::pubsub::{Broker, MemoryAdapter};
use courier::test_util::{trace_init, wait_for};
use courier_wire::{Codec, FrameDecoder, MessageType, WireMessage};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Decoder;

struct Server {
    server: TcpServer,
    broker: Broker,
    manager: Arc<ConnectionManager>,
    addr: std::net::SocketAddr,
}

async fn start_server(configure: impl FnOnce(&mut TcpConfig)) -> Server {
    trace_init();

    let mut config = TcpConfig::default();
    config.port = 0;
    config.drain_timeout_ms = 500;
    configure(&mut config);

    let broker = Broker::new(Arc::new(MemoryAdapter::new(1000)));
    broker.connect().await.unwrap();

    let manager = Arc::new(ConnectionManager::new(
        config.max_connections,
        config.max_connections_per_ip,
    ));
    let verifier = Arc::new(StaticTokenVerifier::new(HashMap::from([
        ("token-a".to_owned(), "user-a".to_owned()),
        ("token-b".to_owned(), "user-b".to_owned()),
    ])));
    let users = Arc::new(InMemoryUserRepository::with_users([
        User {
            id: "user-a".to_owned(),
            username: "alice".to_owned(),
            created_at: Utc::now(),
        },
        User {
            id: "user-b".to_owned(),
            username: "bob".to_owned(),
            created_at: Utc::now(),
        },
    ]));
    let handler = Arc::new(MessageHandler::new(
        Arc::clone(&manager),
        broker.clone(),
        verifier,
        users,
        Codec::new(config.max_frame_size),
    ));

    let server = TcpServer::new(config, Arc::clone(&manager), handler);
    let addr = server.start().await.unwrap();
    Server {
        server,
        broker,
        manager,
        addr,
    }
}

struct Client {
    stream: TcpStream,
    decoder: FrameDecoder,
    buffer: BytesMut,
    codec: Codec,
}

impl Client {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            decoder: FrameDecoder::default(),
            buffer: BytesMut::new(),
            codec: Codec::default(),
        }
    }

    async fn send(&mut self, message_type: MessageType, payload: serde_json::Value) {
        let bytes = self.codec.encode(message_type, &payload).unwrap();
        self.stream.write_all(&bytes).await.unwrap();
    }

    async fn next_message(&mut self) -> WireMessage {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.buffer).unwrap() {
                return self.codec.decode(&frame).unwrap();
            }
            let mut chunk = [0u8; 4096];
            let read = timeout(Duration::from_secs(2), self.stream.read(&mut chunk))
                .await
                .expect("read timed out")
                .expect("read failed");
            assert!(read > 0, "connection closed while awaiting a frame");
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }

    async fn authenticate(&mut self, token: &str) -> WireMessage {
        self.send(MessageType::Auth, json!({ "token": token })).await;
        self.next_message().await
    }

    /// Reads until EOF, asserting the peer closed.
    async fn expect_close(&mut self) {
        let mut chunk = [0u8; 1024];
        loop {
            let read = timeout(Duration::from_secs(2), self.stream.read(&mut chunk))
                .await
                .expect("read timed out")
                .expect("read failed");
            if read == 0 {
                return;
            }
        }
    }
}

#[tokio::test]
async fn auth_subscribe_publish_deliver() {
    let server = start_server(|_| {}).await;

    let mut subscriber = Client::connect(server.addr).await;
    let reply = subscriber.authenticate("token-a").await;
    assert_eq!(reply.message_type, MessageType::AuthSuccess);
    assert_eq!(reply.data["userId"], "user-a");

    subscriber
        .send(MessageType::Subscribe, json!({ "topic": "room" }))
        .await;
    let reply = subscriber.next_message().await;
    assert_eq!(reply.message_type, MessageType::Subscribed);
    assert_eq!(reply.data["topic"], "room");
    assert!(reply.data["subscriptionId"].as_str().is_some());

    let mut publisher = Client::connect(server.addr).await;
    publisher.authenticate("token-b").await;
    publisher
        .send(
            MessageType::Message,
            json!({ "topic": "room", "content": { "t": 1 } }),
        )
        .await;

    let delivery = subscriber.next_message().await;
    assert_eq!(delivery.message_type, MessageType::ServerMessage);
    assert_eq!(delivery.data["topic"], "room");
    assert_eq!(delivery.data["content"], json!({ "t": 1 }));
    let stamp = delivery.data["timestamp"].as_str().unwrap();
    assert!(stamp.parse::<DateTime<Utc>>().is_ok());

    server.server.stop().await;
}

#[tokio::test]
async fn unauthenticated_operations_are_refused() {
    let server = start_server(|_| {}).await;

    let mut client = Client::connect(server.addr).await;
    client
        .send(MessageType::Subscribe, json!({ "topic": "room" }))
        .await;
    let reply = client.next_message().await;
    assert_eq!(reply.message_type, MessageType::Error);
    assert_eq!(reply.data["code"], "UNAUTHORIZED");

    // The connection survives and can still authenticate.
    let reply = client.authenticate("token-a").await;
    assert_eq!(reply.message_type, MessageType::AuthSuccess);

    server.server.stop().await;
}

#[tokio::test]
async fn per_ip_cap_rejects_the_fourth_connection() {
    let server = start_server(|config| {
        config.max_connections_per_ip = 3;
    })
    .await;

    let mut clients = Vec::new();
    for _ in 0..3 {
        let mut client = Client::connect(server.addr).await;
        let reply = client.authenticate("token-a").await;
        assert_eq!(reply.message_type, MessageType::AuthSuccess);
        clients.push(client);
    }

    let mut rejected = Client::connect(server.addr).await;
    let reply = rejected.next_message().await;
    assert_eq!(reply.message_type, MessageType::Error);
    assert_eq!(reply.data["code"], "CONFLICT");
    assert_eq!(reply.data["message"], "conflict: Connection limit reached");
    rejected.expect_close().await;

    assert_eq!(server.manager.stats().active_connections, 3);

    server.server.stop().await;
}

#[tokio::test]
async fn fragmented_frames_reassemble() {
    let server = start_server(|_| {}).await;

    let mut client = Client::connect(server.addr).await;
    let bytes = client
        .codec
        .encode(MessageType::Ping, &json!({ "timestamp": 7 }))
        .unwrap();

    // Feed the frame in three fragments with pauses in between.
    client.stream.write_all(&bytes[0..3]).await.unwrap();
    client.stream.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.stream.write_all(&bytes[3..4]).await.unwrap();
    client.stream.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.stream.write_all(&bytes[4..]).await.unwrap();

    let reply = client.next_message().await;
    assert_eq!(reply.message_type, MessageType::Pong);
    assert_eq!(reply.data["timestamp"], 7);

    server.server.stop().await;
}

#[tokio::test]
async fn invalid_type_byte_skips_without_desync() {
    let server = start_server(|_| {}).await;

    let mut client = Client::connect(server.addr).await;
    // A poisoned frame with type byte 0x42.
    let mut poison = BytesMut::new();
    let payload = br#"{"junk":true}"#;
    poison.extend_from_slice(&((1 + payload.len()) as u32).to_be_bytes());
    poison.extend_from_slice(&[0x42]);
    poison.extend_from_slice(payload);
    client.stream.write_all(&poison).await.unwrap();

    let reply = client.next_message().await;
    assert_eq!(reply.message_type, MessageType::Error);
    assert_eq!(reply.data["code"], "INVALID_MESSAGE_TYPE");

    // The stream is still in sync: a well-formed frame parses.
    client
        .send(MessageType::Ping, json!({ "timestamp": 1 }))
        .await;
    let reply = client.next_message().await;
    assert_eq!(reply.message_type, MessageType::Pong);

    server.server.stop().await;
}

#[tokio::test]
async fn oversized_frame_closes_the_connection() {
    let server = start_server(|config| {
        config.max_frame_size = 256;
    })
    .await;

    let mut client = Client::connect(server.addr).await;
    let mut oversized = BytesMut::new();
    oversized.extend_from_slice(&100_000u32.to_be_bytes());
    oversized.extend_from_slice(&[0x01]);
    client.stream.write_all(&oversized).await.unwrap();

    let reply = client.next_message().await;
    assert_eq!(reply.message_type, MessageType::Error);
    assert_eq!(reply.data["code"], "FRAME_TOO_LARGE");
    client.expect_close().await;

    wait_for(Duration::from_secs(2), || async {
        server.manager.active_count() == 0
    })
    .await;

    server.server.stop().await;
}

#[tokio::test]
async fn disconnect_cleans_up_subscriptions() {
    let server = start_server(|_| {}).await;

    let mut client = Client::connect(server.addr).await;
    client.authenticate("token-a").await;
    for topic in ["x", "y"] {
        client
            .send(MessageType::Subscribe, json!({ "topic": topic }))
            .await;
        client.next_message().await;
    }
    assert_eq!(server.broker.stats().active_subscriptions, 2);

    drop(client);

    let broker = server.broker.clone();
    let manager = Arc::clone(&server.manager);
    wait_for(Duration::from_secs(2), move || {
        let broker = broker.clone();
        let manager = Arc::clone(&manager);
        async move {
            broker.stats().active_subscriptions == 0 && manager.active_count() == 0
        }
    })
    .await;

    server.server.stop().await;
}

#[tokio::test]
async fn stop_drains_active_connections() {
    let server = start_server(|_| {}).await;

    let mut client = Client::connect(server.addr).await;
    client.authenticate("token-a").await;

    server.server.stop().await;
    client.expect_close().await;
    assert_eq!(server.manager.active_count(), 0);

    // The listener is gone.
    assert!(TcpStream::connect(server.addr).await.is_err());
}

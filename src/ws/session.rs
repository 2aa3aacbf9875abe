use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use warp::ws::{Message, WebSocket};

use super::{ClientMessage, ServerMessage};
use crate::auth::{TokenVerifier, UserRepository};
use crate::config::WebSocketConfig;
use crate::error::{ConflictSnafu, NotFoundSnafu, UnauthorizedSnafu};
use crate::net::{ConnectionId, ConnectionManager, HandlerStats};
use crate::pubsub::Broker;
use crate::{Result, ServerError};

/// Placeholder peer for transports that hide the remote address.
const UNKNOWN_PEER: SocketAddr = SocketAddr::new(
    std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
    0,
);

#[derive(Default)]
struct Counters {
    messages_processed: AtomicU64,
    auth_attempts: AtomicU64,
    auth_successes: AtomicU64,
    auth_failures: AtomicU64,
    subscriptions: AtomicU64,
    unsubscriptions: AtomicU64,
    messages_published: AtomicU64,
    errors: AtomicU64,
}

/// The WebSocket session front-end.
///
/// Sessions register in their own [`ConnectionManager`] and run the same
/// state machine as the TCP handler: authenticate, then subscribe,
/// unsubscribe, publish, ping. Outbound traffic flows through the manager's
/// per-connection channel as serialized JSON text frames.
pub struct WsFrontend {
    manager: Arc<ConnectionManager>,
    broker: Broker,
    verifier: Arc<dyn TokenVerifier>,
    users: Arc<dyn UserRepository>,
    counters: Counters,
}

impl WsFrontend {
    /// Wires the front-end up with its collaborators.
    pub fn new(
        config: &WebSocketConfig,
        broker: Broker,
        verifier: Arc<dyn TokenVerifier>,
        users: Arc<dyn UserRepository>,
    ) -> Self {
        Self {
            manager: Arc::new(ConnectionManager::new(
                config.max_connections,
                config.max_connections_per_ip,
            )),
            broker,
            verifier,
            users,
            counters: Counters::default(),
        }
    }

    /// The manager tracking WebSocket sessions.
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Counter snapshot.
    pub fn stats(&self) -> HandlerStats {
        HandlerStats {
            messages_processed: self.counters.messages_processed.load(Ordering::Relaxed),
            auth_attempts: self.counters.auth_attempts.load(Ordering::Relaxed),
            auth_successes: self.counters.auth_successes.load(Ordering::Relaxed),
            auth_failures: self.counters.auth_failures.load(Ordering::Relaxed),
            subscriptions: self.counters.subscriptions.load(Ordering::Relaxed),
            unsubscriptions: self.counters.unsubscriptions.load(Ordering::Relaxed),
            messages_published: self.counters.messages_published.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }

    /// Drives one upgraded socket until it closes.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket, peer: Option<SocketAddr>) {
        let peer = peer.unwrap_or(UNKNOWN_PEER);
        let (mut ws_tx, mut ws_rx) = socket.split();
        let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::unbounded_channel::<Bytes>();
        let cancel = CancellationToken::new();

        let id = match self.manager.add_connection(peer, outbound_tx, cancel.clone()) {
            Ok(id) => id,
            Err(error) => {
                counter!("courier_ws_connections_rejected_total").increment(1);
                warn!(%peer, %error, "WebSocket connection rejected.");
                let reply = error_message(&error);
                if let Ok(text) = serde_json::to_string(&reply) {
                    let _ = ws_tx.send(Message::text(text)).await;
                }
                let _ = ws_tx.send(Message::close()).await;
                return;
            }
        };
        counter!("courier_ws_connections_accepted_total").increment(1);
        debug!(connection_id = %id, %peer, "WebSocket session started.");

        let writer_cancel = cancel.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    queued = outbound_rx.recv() => match queued {
                        Some(bytes) => {
                            let text = String::from_utf8_lossy(&bytes).into_owned();
                            if ws_tx.send(Message::text(text)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = writer_cancel.cancelled() => break,
                }
            }
            let _ = ws_tx.send(Message::close()).await;
        });

        loop {
            let item = tokio::select! {
                item = ws_rx.next() => item,
                _ = cancel.cancelled() => break,
            };
            let message = match item {
                Some(Ok(message)) => message,
                Some(Err(error)) => {
                    debug!(connection_id = %id, %error, "WebSocket read error.");
                    break;
                }
                None => break,
            };

            if message.is_close() {
                break;
            }
            self.manager.update_activity(&id);
            let Ok(text) = message.to_str() else {
                // Binary, ping and pong frames carry no session messages.
                continue;
            };

            match serde_json::from_str::<ClientMessage>(text) {
                Ok(client_message) => self.handle_message(&id, client_message).await,
                Err(_) => {
                    self.reply_error(
                        &id,
                        false,
                        &ServerError::InvalidInput {
                            message: "malformed message".to_owned(),
                        },
                    );
                }
            }
        }

        self.disconnect(&id).await;
        cancel.cancel();
        let _ = writer.await;
        debug!(connection_id = %id, %peer, "WebSocket session closed.");
    }

    /// Routes one parsed message; errors become typed replies.
    async fn handle_message(&self, id: &ConnectionId, message: ClientMessage) {
        self.counters.messages_processed.fetch_add(1, Ordering::Relaxed);
        counter!("courier_ws_messages_processed_total").increment(1);

        let is_auth = matches!(message, ClientMessage::Auth { .. });
        let result = match message {
            ClientMessage::Auth { token } => self.handle_auth(id, &token).await,
            ClientMessage::Subscribe { topic } => self.handle_subscribe(id, topic).await,
            ClientMessage::Unsubscribe { topic } => self.handle_unsubscribe(id, &topic).await,
            ClientMessage::Message { topic, data, metadata } => {
                self.handle_publish(id, &topic, data, metadata).await
            }
            ClientMessage::Ping => {
                self.send(id, &ServerMessage::Pong);
                Ok(())
            }
        };

        if let Err(error) = result {
            self.reply_error(id, is_auth, &error);
        }
    }

    async fn handle_auth(&self, id: &ConnectionId, token: &str) -> Result<()> {
        self.counters.auth_attempts.fetch_add(1, Ordering::Relaxed);

        if self.manager.is_authenticated(id) {
            self.counters.auth_failures.fetch_add(1, Ordering::Relaxed);
            return ConflictSnafu {
                message: "Already authenticated",
            }
            .fail();
        }

        let verified = match self.verifier.verify(token).await {
            Ok(verified) => verified,
            Err(error) => {
                self.counters.auth_failures.fetch_add(1, Ordering::Relaxed);
                return Err(error);
            }
        };
        let user = match self.users.find_by_id(&verified.user_id).await? {
            Some(user) => user,
            None => {
                self.counters.auth_failures.fetch_add(1, Ordering::Relaxed);
                return NotFoundSnafu {
                    message: format!("user {} not found", verified.user_id),
                }
                .fail();
            }
        };

        self.manager
            .authenticate_connection(id, &verified.user_id, user);
        self.counters.auth_successes.fetch_add(1, Ordering::Relaxed);
        self.send(
            id,
            &ServerMessage::AuthSuccess {
                user_id: verified.user_id,
            },
        );
        Ok(())
    }

    async fn handle_subscribe(&self, id: &ConnectionId, topic: String) -> Result<()> {
        self.require_authenticated(id)?;

        if self.manager.has_subscription(id, &topic) {
            return ConflictSnafu {
                message: format!("Already subscribed to {topic}"),
            }
            .fail();
        }

        let forwarder = {
            let manager = Arc::clone(&self.manager);
            let id = id.clone();
            Arc::new(move |message: crate::pubsub::PubSubMessage| {
                let delivery = ServerMessage::Message {
                    topic: message.topic,
                    data: message.data,
                    metadata: (!message.metadata.is_empty()).then_some(message.metadata),
                };
                match serde_json::to_vec(&delivery) {
                    Ok(bytes) => {
                        manager.send_to_connection(&id, Bytes::from(bytes));
                    }
                    Err(error) => warn!(connection_id = %id, %error, "Failed to encode delivery."),
                }
            })
        };

        let subscription_id = self.broker.subscribe(&topic, forwarder).await?;
        if !self
            .manager
            .add_subscription(id, &topic, subscription_id.clone())
        {
            let _ = self.broker.unsubscribe(&subscription_id).await;
            return Ok(());
        }

        self.counters.subscriptions.fetch_add(1, Ordering::Relaxed);
        self.send(id, &ServerMessage::Subscribed { topic });
        Ok(())
    }

    async fn handle_unsubscribe(&self, id: &ConnectionId, topic: &str) -> Result<()> {
        self.require_authenticated(id)?;

        let Some(subscription_id) = self.manager.remove_subscription(id, topic) else {
            return NotFoundSnafu {
                message: format!("Not subscribed to {topic}"),
            }
            .fail();
        };

        self.broker.unsubscribe(&subscription_id).await?;
        self.counters.unsubscriptions.fetch_add(1, Ordering::Relaxed);
        self.send(
            id,
            &ServerMessage::Unsubscribed {
                topic: topic.to_owned(),
            },
        );
        Ok(())
    }

    async fn handle_publish(
        &self,
        id: &ConnectionId,
        topic: &str,
        data: serde_json::Value,
        metadata: Option<HashMap<String, String>>,
    ) -> Result<()> {
        self.require_authenticated(id)?;
        let user_id = self.manager.user_id_of(id).unwrap_or_default();

        let mut metadata = metadata.unwrap_or_default();
        metadata.insert("userId".to_owned(), user_id);

        match self.broker.publish(topic, data, metadata).await {
            Ok(_) => {
                self.counters
                    .messages_published
                    .fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(error) => {
                warn!(connection_id = %id, %error, "Publish failed.");
                crate::error::DependencySnafu {
                    message: "Publish failed",
                }
                .fail()
            }
        }
    }

    /// Tears down a closing session, releasing broker subscriptions first.
    async fn disconnect(&self, id: &ConnectionId) {
        for (topic, subscription_id) in self.manager.subscriptions_of(id) {
            if let Err(error) = self.broker.unsubscribe(&subscription_id).await {
                debug!(connection_id = %id, topic, %error, "Unsubscribe during disconnect failed.");
            }
        }
        self.manager.remove_connection(id);
    }

    fn require_authenticated(&self, id: &ConnectionId) -> Result<()> {
        if self.manager.is_authenticated(id) {
            Ok(())
        } else {
            UnauthorizedSnafu {
                message: "Authentication required",
            }
            .fail()
        }
    }

    fn reply_error(&self, id: &ConnectionId, auth_reply: bool, error: &ServerError) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        counter!("courier_ws_errors_total").increment(1);

        let reply = if auth_reply {
            ServerMessage::AuthError {
                message: error.to_string(),
                code: Some(error.code().to_owned()),
            }
        } else {
            error_message(error)
        };
        self.send(id, &reply);
    }

    fn send(&self, id: &ConnectionId, message: &ServerMessage) {
        match serde_json::to_vec(message) {
            Ok(bytes) => {
                self.manager.send_to_connection(id, Bytes::from(bytes));
            }
            Err(error) => warn!(connection_id = %id, %error, "Failed to encode reply."),
        }
        trace!(connection_id = %id, "Queued server message.");
    }
}

fn error_message(error: &ServerError) -> ServerMessage {
    ServerMessage::Error {
        code: error.code().to_owned(),
        message: error.to_string(),
        details: None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as StdHashMap;
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;
    use crate::auth::{InMemoryUserRepository, StaticTokenVerifier, User};
    use crate::pubsub::MemoryAdapter;

    struct Client {
        id: ConnectionId,
        rx: mpsc::UnboundedReceiver<Bytes>,
    }

    async fn frontend() -> Arc<WsFrontend> {
        let broker = Broker::new(Arc::new(MemoryAdapter::new(100)));
        broker.connect().await.unwrap();
        let verifier = Arc::new(StaticTokenVerifier::new(StdHashMap::from([(
            "valid-token".to_owned(),
            "u1".to_owned(),
        )])));
        let users = Arc::new(InMemoryUserRepository::with_users([User {
            id: "u1".to_owned(),
            username: "alice".to_owned(),
            created_at: Utc::now(),
        }]));
        Arc::new(WsFrontend::new(
            &WebSocketConfig::default(),
            broker,
            verifier,
            users,
        ))
    }

    fn client(frontend: &WsFrontend) -> Client {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = frontend
            .manager
            .add_connection(
                "127.0.0.1:6000".parse().unwrap(),
                tx,
                CancellationToken::new(),
            )
            .unwrap();
        Client { id, rx }
    }

    async fn next_message(client: &mut Client) -> ServerMessage {
        let bytes = timeout(Duration::from_secs(1), client.rx.recv())
            .await
            .expect("no reply")
            .expect("channel closed");
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn mirrors_the_tcp_state_machine() {
        let frontend = frontend().await;
        let mut client = client(&frontend);

        // Unauthenticated operations are refused.
        frontend
            .handle_message(&client.id, ClientMessage::Subscribe { topic: "room".into() })
            .await;
        match next_message(&mut client).await {
            ServerMessage::Error { code, .. } => assert_eq!(code, "UNAUTHORIZED"),
            other => panic!("unexpected reply: {other:?}"),
        }

        // Bad token replies auth_error and allows retry.
        frontend
            .handle_message(&client.id, ClientMessage::Auth { token: "wrong".into() })
            .await;
        match next_message(&mut client).await {
            ServerMessage::AuthError { code, .. } => {
                assert_eq!(code.as_deref(), Some("UNAUTHORIZED"))
            }
            other => panic!("unexpected reply: {other:?}"),
        }

        frontend
            .handle_message(&client.id, ClientMessage::Auth { token: "valid-token".into() })
            .await;
        assert_eq!(
            next_message(&mut client).await,
            ServerMessage::AuthSuccess { user_id: "u1".into() }
        );

        frontend
            .handle_message(&client.id, ClientMessage::Subscribe { topic: "room".into() })
            .await;
        assert_eq!(
            next_message(&mut client).await,
            ServerMessage::Subscribed { topic: "room".into() }
        );

        // Duplicate subscribe is rejected like TCP.
        frontend
            .handle_message(&client.id, ClientMessage::Subscribe { topic: "room".into() })
            .await;
        match next_message(&mut client).await {
            ServerMessage::Error { code, .. } => assert_eq!(code, "CONFLICT"),
            other => panic!("unexpected reply: {other:?}"),
        }

        frontend
            .handle_message(
                &client.id,
                ClientMessage::Message {
                    topic: "room".into(),
                    data: json!({ "n": 1 }),
                    metadata: None,
                },
            )
            .await;
        match next_message(&mut client).await {
            ServerMessage::Message { topic, data, metadata } => {
                assert_eq!(topic, "room");
                assert_eq!(data, json!({ "n": 1 }));
                assert_eq!(metadata.unwrap()["userId"], "u1");
            }
            other => panic!("unexpected reply: {other:?}"),
        }

        frontend
            .handle_message(&client.id, ClientMessage::Ping)
            .await;
        assert_eq!(next_message(&mut client).await, ServerMessage::Pong);
    }

    #[tokio::test]
    async fn disconnect_releases_subscriptions() {
        let frontend = frontend().await;
        let mut client = client(&frontend);

        frontend
            .handle_message(&client.id, ClientMessage::Auth { token: "valid-token".into() })
            .await;
        next_message(&mut client).await;
        for topic in ["x", "y"] {
            frontend
                .handle_message(&client.id, ClientMessage::Subscribe { topic: topic.into() })
                .await;
            next_message(&mut client).await;
        }
        assert_eq!(frontend.broker.stats().active_subscriptions, 2);

        frontend.disconnect(&client.id).await;
        assert_eq!(frontend.broker.stats().active_subscriptions, 0);
        assert_eq!(frontend.manager.active_count(), 0);
    }
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use courier_wire::{
    AuthPayload, Codec, MessagePayload, MessageType, PingPayload, SubscribePayload, WireMessage,
};
use metrics::counter;
use serde_json::Value;
use tracing::{debug, trace, warn};

use super::{ConnectionId, ConnectionManager};
use crate::auth::{TokenVerifier, UserRepository};
use crate::error::{
    ConflictSnafu, InvalidInputSnafu, NotFoundSnafu, UnauthorizedSnafu,
};
use crate::pubsub::Broker;
use crate::{Result, ServerError};

/// Counter snapshot reported by [`MessageHandler::stats`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct HandlerStats {
    /// Messages routed through the handler.
    pub messages_processed: u64,
    /// Authentication attempts.
    pub auth_attempts: u64,
    /// Successful authentications.
    pub auth_successes: u64,
    /// Failed authentications.
    pub auth_failures: u64,
    /// Subscriptions created.
    pub subscriptions: u64,
    /// Subscriptions dropped by request.
    pub unsubscriptions: u64,
    /// Client publications accepted.
    pub messages_published: u64,
    /// Errors replied to clients.
    pub errors: u64,
}

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

/// Per-connection protocol state machine.
///
/// Routes decoded messages by type, translating them into broker and manager
/// operations. The server dispatches messages of one connection sequentially,
/// so per-connection ordering follows arrival order; the handler itself holds
/// no per-connection state beyond what the manager tracks.
pub struct MessageHandler {
    manager: Arc<ConnectionManager>,
    broker: Broker,
    verifier: Arc<dyn TokenVerifier>,
    users: Arc<dyn UserRepository>,
    codec: Codec,
    counters: Counters,
}

impl MessageHandler {
    /// Wires the handler up with its collaborators.
    pub fn new(
        manager: Arc<ConnectionManager>,
        broker: Broker,
        verifier: Arc<dyn TokenVerifier>,
        users: Arc<dyn UserRepository>,
        codec: Codec,
    ) -> Self {
        Self {
            manager,
            broker,
            verifier,
            users,
            codec,
            counters: Counters::default(),
        }
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

    /// Routes one decoded message; every error is reported to the client as
    /// a typed reply and never tears the connection down.
    pub async fn handle_message(&self, id: &ConnectionId, message: WireMessage) {
        self.counters.messages_processed.fetch_add(1, Ordering::Relaxed);
        counter!("courier_tcp_messages_processed_total").increment(1);
        trace!(connection_id = %id, message_type = %message.message_type, "Handling message.");

        let result = match message.message_type {
            MessageType::Auth => self.handle_auth(id, message.data).await,
            MessageType::Subscribe => self.handle_subscribe(id, message.data).await,
            MessageType::Unsubscribe => self.handle_unsubscribe(id, message.data).await,
            MessageType::Message => self.handle_publish(id, message.data).await,
            MessageType::Ping => self.handle_ping(id, message.data),
            // Activity was already bumped before dispatch.
            MessageType::Pong => Ok(()),
            MessageType::AuthSuccess
            | MessageType::AuthError
            | MessageType::Subscribed
            | MessageType::Unsubscribed
            | MessageType::ServerMessage
            | MessageType::Error => {
                if self.manager.is_authenticated(id) {
                    InvalidInputSnafu {
                        message: "Unknown message type",
                    }
                    .fail()
                } else {
                    UnauthorizedSnafu {
                        message: "Authentication required",
                    }
                    .fail()
                }
            }
        };

        if let Err(error) = result {
            self.reply_error(id, message.message_type, &error);
        }
    }

    /// Tears down a disconnecting session: every broker subscription the
    /// connection held is released, then the connection leaves the manager.
    /// Cleanup failures are logged and swallowed — the connection is going
    /// away regardless.
    pub async fn on_disconnect(&self, id: &ConnectionId) {
        for (topic, subscription_id) in self.manager.subscriptions_of(id) {
            if let Err(error) = self.broker.unsubscribe(&subscription_id).await {
                debug!(
                    connection_id = %id,
                    topic,
                    %error,
                    "Unsubscribe during disconnect failed."
                );
            }
        }
        self.manager.remove_connection(id);
    }

    async fn handle_auth(&self, id: &ConnectionId, data: Value) -> Result<()> {
        self.counters.auth_attempts.fetch_add(1, Ordering::Relaxed);

        if self.manager.is_authenticated(id) {
            self.counters.auth_failures.fetch_add(1, Ordering::Relaxed);
            return ConflictSnafu {
                message: "Already authenticated",
            }
            .fail();
        }

        let payload: AuthPayload = parse_payload(data, "AUTH requires a token")?;
        let verified = match self.verifier.verify(&payload.token).await {
            Ok(verified) => verified,
            Err(error) => {
                self.counters.auth_failures.fetch_add(1, Ordering::Relaxed);
                counter!("courier_tcp_auth_failures_total").increment(1);
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
        counter!("courier_tcp_auth_successes_total").increment(1);
        debug!(connection_id = %id, user_id = %verified.user_id, "Connection authenticated.");

        self.send(
            id,
            self.codec
                .encode_auth_success(&verified.user_id, "Authentication successful"),
        );
        Ok(())
    }

    async fn handle_subscribe(&self, id: &ConnectionId, data: Value) -> Result<()> {
        self.require_authenticated(id)?;
        let payload: SubscribePayload = parse_payload(data, "SUBSCRIBE requires a topic")?;

        if self.manager.has_subscription(id, &payload.topic) {
            return ConflictSnafu {
                message: format!("Already subscribed to {}", payload.topic),
            }
            .fail();
        }

        let forwarder = {
            let manager = Arc::clone(&self.manager);
            let codec = self.codec.clone();
            let id = id.clone();
            Arc::new(move |message: crate::pubsub::PubSubMessage| {
                match codec.encode_server_message(
                    &message.topic,
                    &message.data,
                    message.published_at,
                ) {
                    Ok(bytes) => {
                        manager.send_to_connection(&id, bytes);
                    }
                    Err(error) => {
                        warn!(connection_id = %id, %error, "Failed to encode delivery.");
                    }
                }
            })
        };

        let subscription_id = self.broker.subscribe(&payload.topic, forwarder).await?;
        if !self
            .manager
            .add_subscription(id, &payload.topic, subscription_id.clone())
        {
            // The connection vanished between subscribe and bookkeeping.
            let _ = self.broker.unsubscribe(&subscription_id).await;
            return Ok(());
        }

        self.counters.subscriptions.fetch_add(1, Ordering::Relaxed);
        counter!("courier_tcp_subscriptions_total").increment(1);
        self.send(
            id,
            self.codec
                .encode_subscribed(&payload.topic, subscription_id.as_str()),
        );
        Ok(())
    }

    async fn handle_unsubscribe(&self, id: &ConnectionId, data: Value) -> Result<()> {
        self.require_authenticated(id)?;
        let payload: SubscribePayload = parse_payload(data, "UNSUBSCRIBE requires a topic")?;

        let Some(subscription_id) = self.manager.remove_subscription(id, &payload.topic) else {
            return NotFoundSnafu {
                message: format!("Not subscribed to {}", payload.topic),
            }
            .fail();
        };

        self.broker.unsubscribe(&subscription_id).await?;
        self.counters.unsubscriptions.fetch_add(1, Ordering::Relaxed);
        self.send(id, self.codec.encode_unsubscribed(&payload.topic));
        Ok(())
    }

    async fn handle_publish(&self, id: &ConnectionId, data: Value) -> Result<()> {
        self.require_authenticated(id)?;
        let payload: MessagePayload = parse_payload(data, "MESSAGE requires topic and content")?;
        let user_id = self.manager.user_id_of(id).unwrap_or_default();

        let metadata =
            std::collections::HashMap::from([("userId".to_owned(), user_id)]);
        match self
            .broker
            .publish(&payload.topic, payload.content, metadata)
            .await
        {
            Ok(_) => {
                self.counters
                    .messages_published
                    .fetch_add(1, Ordering::Relaxed);
                counter!("courier_tcp_messages_published_total").increment(1);
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

    fn handle_ping(&self, id: &ConnectionId, data: Value) -> Result<()> {
        let timestamp = serde_json::from_value::<PingPayload>(data)
            .map(|p| p.timestamp)
            .unwrap_or_else(|_| Utc::now().timestamp_millis());
        self.send(id, self.codec.encode_pong(timestamp));
        Ok(())
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

    fn reply_error(&self, id: &ConnectionId, inbound: MessageType, error: &ServerError) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        counter!("courier_tcp_errors_total").increment(1);

        // Failed authentication attempts get the dedicated reply type so
        // clients can distinguish a retryable login problem.
        let bytes = if inbound == MessageType::Auth {
            self.codec.encode(
                MessageType::AuthError,
                &courier_wire::ErrorPayload {
                    code: error.code().to_owned(),
                    message: error.to_string(),
                },
            )
        } else {
            self.codec.encode_error(error.code(), &error.to_string())
        };
        self.send(id, bytes);
    }

    fn send(&self, id: &ConnectionId, bytes: Result<bytes::Bytes, courier_wire::WireError>) {
        match bytes {
            Ok(bytes) => {
                self.manager.send_to_connection(id, bytes);
            }
            Err(error) => warn!(connection_id = %id, %error, "Failed to encode reply."),
        }
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(data: Value, context: &str) -> Result<T> {
    serde_json::from_value(data).map_err(|_| {
        InvalidInputSnafu {
            message: context.to_owned(),
        }
        .build()
    })
}

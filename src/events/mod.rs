//! Domain events and their delivery.
//!
//! Business services emit [`AppEvent`]s on the [`EventBus`]; the
//! [`EventBridge`] translates them into broker topic publications so
//! subscribed sessions receive live updates.

mod bridge;
mod bus;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use bridge::EventBridge;
pub use bus::{EventBus, EventHandler, HandlerId};

use crate::auth::User;

/// A chat message as carried by `message.sent` events.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Unique message id.
    pub id: String,
    /// Sending user.
    pub sender_id: String,
    /// Channel the message was posted to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    /// Direct-message recipient, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    /// Message body.
    pub content: Value,
    /// When the message was sent.
    pub sent_at: DateTime<Utc>,
}

/// The closed set of domain event types.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EventType {
    /// A user account was created.
    UserCreated,
    /// A user account was updated.
    UserUpdated,
    /// A user account was deleted.
    UserDeleted,
    /// A chat message was sent.
    MessageSent,
}

impl EventType {
    /// The dotted name used in event metadata.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UserCreated => "user.created",
            Self::UserUpdated => "user.updated",
            Self::UserDeleted => "user.deleted",
            Self::MessageSent => "message.sent",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event payload, one variant per [`EventType`].
#[derive(Clone, Debug, PartialEq)]
pub enum EventKind {
    /// A user account was created.
    UserCreated {
        /// The new account.
        user: User,
    },
    /// A user account was updated.
    UserUpdated {
        /// The updated account id.
        user_id: String,
        /// The changed fields.
        changes: Value,
    },
    /// A user account was deleted.
    UserDeleted {
        /// The removed account id.
        user_id: String,
    },
    /// A chat message was sent.
    MessageSent {
        /// The message.
        message: ChatMessage,
    },
}

impl EventKind {
    /// The event type of this payload.
    pub const fn event_type(&self) -> EventType {
        match self {
            Self::UserCreated { .. } => EventType::UserCreated,
            Self::UserUpdated { .. } => EventType::UserUpdated,
            Self::UserDeleted { .. } => EventType::UserDeleted,
            Self::MessageSent { .. } => EventType::MessageSent,
        }
    }
}

/// A domain event with envelope identity.
///
/// Ordering between events is the order of emission within a single emitter;
/// event ids are opaque.
#[derive(Clone, Debug, PartialEq)]
pub struct AppEvent {
    /// Opaque unique event id.
    pub event_id: String,
    /// Emission timestamp.
    pub timestamp: DateTime<Utc>,
    /// Optional request correlation id.
    pub correlation_id: Option<String>,
    /// The payload.
    pub kind: EventKind,
}

impl AppEvent {
    /// Wraps a payload into a fresh envelope.
    pub fn new(kind: EventKind) -> Self {
        Self {
            event_id: format!("evt_{}", Uuid::new_v4().simple()),
            timestamp: Utc::now(),
            correlation_id: None,
            kind,
        }
    }

    /// Attaches a correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// The event type of the payload.
    pub const fn event_type(&self) -> EventType {
        self.kind.event_type()
    }
}

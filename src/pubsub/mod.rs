//! Topic-based publish/subscribe.
//!
//! The [`Broker`] is a thin facade over a swappable [`PubSubAdapter`]; the
//! in-process [`MemoryAdapter`] dispatches directly to local subscribers and
//! the [`NatsAdapter`] routes through an external shared bus.

mod adapter;
mod broker;
mod memory;
mod nats;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use adapter::PubSubAdapter;
pub use broker::Broker;
pub use memory::MemoryAdapter;
pub use nats::NatsAdapter;

/// Opaque unique identifier of a subscription, handed back to the subscriber
/// for later unsubscription.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub(crate) fn generate() -> Self {
        Self(format!("sub_{}", Uuid::new_v4().simple()))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message delivered to matching subscriptions.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PubSubMessage {
    /// Opaque unique message id.
    pub message_id: String,
    /// Concrete topic the message was published on.
    pub topic: String,
    /// Opaque payload.
    pub data: Value,
    /// String metadata attached by the publisher.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Publication timestamp.
    pub published_at: DateTime<Utc>,
}

impl PubSubMessage {
    /// Builds a message with a fresh id and the current timestamp.
    pub fn new(topic: impl Into<String>, data: Value, metadata: HashMap<String, String>) -> Self {
        Self {
            message_id: format!("msg_{}", Uuid::new_v4().simple()),
            topic: topic.into(),
            data,
            metadata,
            published_at: Utc::now(),
        }
    }
}

/// Callback invoked for every message delivered to a subscription.
///
/// Callbacks must be cheap or hand the message off; delivery is dispatched on
/// its own task so a slow callback cannot stall the publisher, but it can
/// still delay its own subscription.
pub type SubscriberCallback = Arc<dyn Fn(PubSubMessage) + Send + Sync>;

/// Public description of an active subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionInfo {
    /// The subscription id.
    pub id: SubscriptionId,
    /// The pattern the subscription was registered with.
    pub pattern: String,
    /// When the subscription was created.
    pub created_at: DateTime<Utc>,
}

/// Counter snapshot reported by adapters and mirrored by the broker.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PubSubStats {
    /// Messages accepted for publication.
    pub messages_published: u64,
    /// Handler invocations dispatched.
    pub messages_delivered: u64,
    /// Publication or delivery errors.
    pub errors: u64,
    /// Currently registered subscriptions.
    pub active_subscriptions: usize,
}

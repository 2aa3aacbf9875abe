use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use super::{
    MemoryAdapter, NatsAdapter, PubSubAdapter, PubSubStats, SubscriberCallback, SubscriptionId,
    SubscriptionInfo,
};
use crate::config::{PubSubAdapterKind, PubSubConfig};
use crate::Result;

/// Thin facade over the configured pub/sub adapter.
///
/// Holds exactly one adapter and mirrors its operations 1:1, giving the rest
/// of the system a stable call site while the back-end stays swappable at
/// startup.
#[derive(Clone)]
pub struct Broker {
    adapter: Arc<dyn PubSubAdapter>,
}

impl Broker {
    /// Wraps an adapter instance.
    pub fn new(adapter: Arc<dyn PubSubAdapter>) -> Self {
        Self { adapter }
    }

    /// Builds the adapter selected by configuration.
    pub fn from_config(config: &PubSubConfig) -> Self {
        let adapter: Arc<dyn PubSubAdapter> = match config.adapter {
            PubSubAdapterKind::Memory => {
                info!(max_messages = config.memory.max_messages, "Using in-memory pubsub adapter.");
                Arc::new(MemoryAdapter::new(config.memory.max_messages))
            }
            PubSubAdapterKind::Nats => {
                info!(url = %config.nats.url, "Using NATS pubsub adapter.");
                Arc::new(NatsAdapter::new(config.nats.url.clone()))
            }
        };
        Self::new(adapter)
    }

    /// Establishes the adapter transport. Idempotent.
    pub async fn connect(&self) -> Result<()> {
        self.adapter.connect().await
    }

    /// Tears the adapter transport down.
    pub async fn disconnect(&self) -> Result<()> {
        self.adapter.disconnect().await
    }

    /// Publishes `data` on a concrete topic, returning the message id.
    pub async fn publish(
        &self,
        topic: &str,
        data: Value,
        metadata: HashMap<String, String>,
    ) -> Result<String> {
        self.adapter.publish(topic, data, metadata).await
    }

    /// Registers a subscription for `pattern`.
    pub async fn subscribe(
        &self,
        pattern: &str,
        handler: SubscriberCallback,
    ) -> Result<SubscriptionId> {
        self.adapter.subscribe(pattern, handler).await
    }

    /// Removes a subscription. Idempotent.
    pub async fn unsubscribe(&self, id: &SubscriptionId) -> Result<()> {
        self.adapter.unsubscribe(id).await
    }

    /// Whether the adapter transport is established.
    pub fn is_connected(&self) -> bool {
        self.adapter.is_connected()
    }

    /// Counter snapshot, mirrored from the adapter.
    pub fn stats(&self) -> PubSubStats {
        self.adapter.stats()
    }

    /// Descriptions of the active subscriptions.
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.adapter.subscriptions()
    }
}

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use super::{PubSubStats, SubscriberCallback, SubscriptionId, SubscriptionInfo};
use crate::Result;

/// Back-end-specific pub/sub transport.
///
/// All operations fail with a dependency error while the adapter is
/// disconnected. Implementations deliver each publication at least once to
/// every subscription that was active at call time.
#[async_trait]
pub trait PubSubAdapter: Send + Sync {
    /// Establishes the transport. Idempotent.
    async fn connect(&self) -> Result<()>;

    /// Tears the transport down; subsequent operations fail.
    async fn disconnect(&self) -> Result<()>;

    /// Publishes `data` on a concrete `topic`, returning the message id.
    async fn publish(
        &self,
        topic: &str,
        data: Value,
        metadata: HashMap<String, String>,
    ) -> Result<String>;

    /// Registers a subscription for `pattern`. Subscribing the same handler
    /// twice yields two independent subscriptions with distinct ids.
    async fn subscribe(&self, pattern: &str, handler: SubscriberCallback)
        -> Result<SubscriptionId>;

    /// Removes a subscription. Idempotent; unknown ids are not an error.
    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<()>;

    /// Whether the transport is currently established.
    fn is_connected(&self) -> bool;

    /// Counter snapshot.
    fn stats(&self) -> PubSubStats;

    /// Descriptions of the currently registered subscriptions.
    fn subscriptions(&self) -> Vec<SubscriptionInfo>;
}

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use metrics::counter;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::{
    PubSubAdapter, PubSubMessage, PubSubStats, SubscriberCallback, SubscriptionId,
    SubscriptionInfo,
};
use crate::error::DependencySnafu;
use crate::{topic, Result};

struct NatsSubscription {
    pattern: String,
    created_at: DateTime<Utc>,
    pump: JoinHandle<()>,
}

/// Adapter routing publications through an external NATS bus.
///
/// The bus payload is the serialized [`PubSubMessage`] envelope, so message
/// ids and metadata survive transit. Plain and `*` patterns map 1:1 onto
/// NATS subjects; any pattern containing `**` subscribes to the firehose
/// subject `>` and filters client-side, because `**` matches zero segments
/// while the NATS `>` wildcard requires at least one.
pub struct NatsAdapter {
    url: String,
    client: Mutex<Option<async_nats::Client>>,
    subscriptions: Mutex<HashMap<SubscriptionId, NatsSubscription>>,
    messages_published: Arc<AtomicU64>,
    messages_delivered: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
}

/// Maps a subscription pattern onto a NATS subject, returning whether
/// deliveries must additionally be filtered with the topic matcher.
fn pattern_to_subject(pattern: &str) -> (String, bool) {
    if pattern.is_empty() || pattern.split('.').any(|segment| segment == "**") {
        (">".to_owned(), true)
    } else {
        (pattern.to_owned(), false)
    }
}

impl NatsAdapter {
    /// Creates a disconnected adapter for the given server URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: Mutex::new(None),
            subscriptions: Mutex::new(HashMap::new()),
            messages_published: Arc::new(AtomicU64::new(0)),
            messages_delivered: Arc::new(AtomicU64::new(0)),
            errors: Arc::new(AtomicU64::new(0)),
        }
    }

    fn current_client(&self) -> Result<async_nats::Client> {
        self.client
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| {
                DependencySnafu {
                    message: "nats adapter is not connected",
                }
                .build()
            })
    }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, HashMap<SubscriptionId, NatsSubscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl PubSubAdapter for NatsAdapter {
    async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let client = async_nats::connect(self.url.as_str()).await.map_err(|error| {
            DependencySnafu {
                message: format!("nats connect to {} failed: {error}", self.url),
            }
            .build()
        })?;

        *self
            .client
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(client);
        debug!(url = %self.url, "NATS pubsub adapter connected.");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let client = self
            .client
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        for (_, subscription) in self.lock_table().drain() {
            subscription.pump.abort();
        }

        if let Some(client) = client {
            if let Err(error) = client.flush().await {
                warn!(%error, "Flush during NATS disconnect failed.");
            }
        }
        debug!("NATS pubsub adapter disconnected.");
        Ok(())
    }

    async fn publish(
        &self,
        topic_name: &str,
        data: Value,
        metadata: HashMap<String, String>,
    ) -> Result<String> {
        let client = self.current_client()?;
        let message = PubSubMessage::new(topic_name, data, metadata);
        let payload = serde_json::to_vec(&message).map_err(|error| {
            DependencySnafu {
                message: format!("failed to serialize bus envelope: {error}"),
            }
            .build()
        })?;

        client
            .publish(topic_name.to_owned(), payload.into())
            .await
            .map_err(|error| {
                self.errors.fetch_add(1, Ordering::Relaxed);
                DependencySnafu {
                    message: format!("nats publish on {topic_name} failed: {error}"),
                }
                .build()
            })?;

        self.messages_published.fetch_add(1, Ordering::Relaxed);
        counter!("courier_pubsub_messages_published_total").increment(1);
        Ok(message.message_id)
    }

    async fn subscribe(
        &self,
        pattern: &str,
        handler: SubscriberCallback,
    ) -> Result<SubscriptionId> {
        let client = self.current_client()?;
        let (subject, needs_filter) = pattern_to_subject(pattern);

        let mut subscriber = client.subscribe(subject).await.map_err(|error| {
            DependencySnafu {
                message: format!("nats subscribe for {pattern} failed: {error}"),
            }
            .build()
        })?;

        let id = SubscriptionId::generate();
        let pump_pattern = pattern.to_owned();
        let delivered = Arc::clone(&self.messages_delivered);
        let pump = tokio::spawn(async move {
            while let Some(bus_message) = subscriber.next().await {
                let envelope: PubSubMessage = match serde_json::from_slice(&bus_message.payload) {
                    Ok(envelope) => envelope,
                    Err(error) => {
                        warn!(%error, subject = %bus_message.subject, "Dropping malformed bus envelope.");
                        continue;
                    }
                };
                if needs_filter && !topic::matches(&envelope.topic, &pump_pattern) {
                    continue;
                }
                delivered.fetch_add(1, Ordering::Relaxed);
                counter!("courier_pubsub_messages_delivered_total").increment(1);
                if panic::catch_unwind(AssertUnwindSafe(|| handler(envelope))).is_err() {
                    error!("Subscriber callback panicked; subscription kept.");
                }
            }
        });

        self.lock_table().insert(
            id.clone(),
            NatsSubscription {
                pattern: pattern.to_owned(),
                created_at: Utc::now(),
                pump,
            },
        );
        debug!(subscription_id = %id, pattern, "Registered NATS subscription.");
        Ok(id)
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<()> {
        self.current_client()?;

        if let Some(subscription) = self.lock_table().remove(id) {
            // Aborting the pump drops the subscriber, which unsubscribes on
            // the bus side.
            subscription.pump.abort();
            debug!(subscription_id = %id, "Removed NATS subscription.");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    fn stats(&self) -> PubSubStats {
        PubSubStats {
            messages_published: self.messages_published.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            active_subscriptions: self.lock_table().len(),
        }
    }

    fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.lock_table()
            .iter()
            .map(|(id, sub)| SubscriptionInfo {
                id: id.clone(),
                pattern: sub.pattern.clone(),
                created_at: sub.created_at,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_and_single_wildcard_patterns_map_to_subjects() {
        assert_eq!(pattern_to_subject("users"), ("users".to_owned(), false));
        assert_eq!(pattern_to_subject("users.*"), ("users.*".to_owned(), false));
        assert_eq!(
            pattern_to_subject("messages.channel.7"),
            ("messages.channel.7".to_owned(), false)
        );
    }

    #[test]
    fn double_wildcard_patterns_fall_back_to_client_side_filtering() {
        assert_eq!(pattern_to_subject("messages.**"), (">".to_owned(), true));
        assert_eq!(pattern_to_subject("a.**.b"), (">".to_owned(), true));
        assert_eq!(pattern_to_subject(""), (">".to_owned(), true));
    }

    #[test]
    fn bus_envelope_round_trips() {
        let message = PubSubMessage::new(
            "messages.user.1",
            serde_json::json!({ "content": "hi" }),
            HashMap::from([("eventType".to_owned(), "message.sent".to_owned())]),
        );
        let bytes = serde_json::to_vec(&message).unwrap();
        let decoded: PubSubMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, message);
    }
}

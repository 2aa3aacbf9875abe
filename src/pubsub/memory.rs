use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

use super::{
    PubSubAdapter, PubSubMessage, PubSubStats, SubscriberCallback, SubscriptionId,
    SubscriptionInfo,
};
use crate::error::DependencySnafu;
use crate::{topic, Result};

struct Subscription {
    pattern: String,
    created_at: chrono::DateTime<Utc>,
    queue: mpsc::UnboundedSender<PubSubMessage>,
}

/// In-process adapter dispatching directly to local subscribers.
///
/// Each subscription owns an unbounded delivery queue drained by its own
/// pump task, which invokes the handler for one message at a time. Publishing
/// only pushes into queues, so a slow or panicking handler can never stall
/// the publisher or a sibling subscription, while every subscriber still
/// sees publications in the order the adapter observed them. A handler panic
/// is caught and logged; the subscription stays registered.
pub struct MemoryAdapter {
    connected: AtomicBool,
    max_messages: usize,
    subscriptions: Mutex<HashMap<SubscriptionId, Subscription>>,
    messages_published: AtomicU64,
    messages_delivered: AtomicU64,
    errors: AtomicU64,
}

impl MemoryAdapter {
    /// Creates a disconnected adapter. `max_messages` is an advisory bound on
    /// queued deliveries; the queues are unbounded, so the bound is not
    /// enforced.
    pub fn new(max_messages: usize) -> Self {
        Self {
            connected: AtomicBool::new(false),
            max_messages,
            subscriptions: Mutex::new(HashMap::new()),
            messages_published: AtomicU64::new(0),
            messages_delivered: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// The advisory queued-message bound this adapter was built with.
    pub fn max_messages(&self) -> usize {
        self.max_messages
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            DependencySnafu {
                message: "pubsub adapter is not connected",
            }
            .fail()
        }
    }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, HashMap<SubscriptionId, Subscription>> {
        // Subscriber callbacks never run under the lock, so poisoning can
        // only come from a panic inside this module.
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl PubSubAdapter for MemoryAdapter {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        debug!("Memory pubsub adapter connected.");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        // Dropping the queues lets each pump drain what was already queued
        // and then exit.
        self.lock_table().clear();
        debug!("Memory pubsub adapter disconnected.");
        Ok(())
    }

    async fn publish(
        &self,
        topic_name: &str,
        data: Value,
        metadata: HashMap<String, String>,
    ) -> Result<String> {
        self.ensure_connected()?;

        let message = PubSubMessage::new(topic_name, data, metadata);
        let mut dispatched = 0usize;
        {
            // Pushing under the table lock fixes one observation order for
            // every subscriber.
            let table = self.lock_table();
            for subscription in table.values() {
                if topic::matches(topic_name, &subscription.pattern)
                    && subscription.queue.send(message.clone()).is_ok()
                {
                    dispatched += 1;
                }
            }
        }

        self.messages_published.fetch_add(1, Ordering::Relaxed);
        self.messages_delivered
            .fetch_add(dispatched as u64, Ordering::Relaxed);
        counter!("courier_pubsub_messages_published_total").increment(1);
        counter!("courier_pubsub_messages_delivered_total").increment(dispatched as u64);
        trace!(
            topic = topic_name,
            subscribers = dispatched,
            message_id = %message.message_id,
            "Dispatched publication."
        );

        Ok(message.message_id)
    }

    async fn subscribe(
        &self,
        pattern: &str,
        handler: SubscriberCallback,
    ) -> Result<SubscriptionId> {
        self.ensure_connected()?;

        let (queue, mut deliveries) = mpsc::unbounded_channel::<PubSubMessage>();
        let id = SubscriptionId::generate();
        let pump_id = id.clone();
        tokio::spawn(async move {
            while let Some(message) = deliveries.recv().await {
                if panic::catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
                    counter!("courier_pubsub_handler_panics_total").increment(1);
                    error!(subscription_id = %pump_id, "Subscriber callback panicked; subscription kept.");
                }
            }
        });

        self.lock_table().insert(
            id.clone(),
            Subscription {
                pattern: pattern.to_owned(),
                created_at: Utc::now(),
                queue,
            },
        );
        debug!(subscription_id = %id, pattern, "Registered subscription.");
        Ok(id)
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<()> {
        self.ensure_connected()?;

        if self.lock_table().remove(id).is_some() {
            debug!(subscription_id = %id, "Removed subscription.");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
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

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::SecondsFormat;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{AppEvent, EventBus, EventKind, EventType, HandlerId};
use crate::pubsub::Broker;

/// Topic namespace for user account events.
const USERS_TOPIC: &str = "users";
/// Topic namespace for chat message events.
const MESSAGES_TOPIC: &str = "messages";

/// Translates domain events into broker topic publications.
///
/// Bridged publications carry `{eventType, eventId, timestamp}` metadata so
/// subscribers can correlate deliveries back to the originating event.
pub struct EventBridge {
    bus: Arc<EventBus>,
    broker: Broker,
    registrations: Mutex<Vec<HandlerId>>,
}

impl EventBridge {
    /// Creates an uninitialised bridge.
    pub fn new(bus: Arc<EventBus>, broker: Broker) -> Self {
        Self {
            bus,
            broker,
            registrations: Mutex::new(Vec::new()),
        }
    }

    /// Registers the bus subscriptions. Idempotent.
    pub fn init(&self) {
        let mut registrations = self
            .registrations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !registrations.is_empty() {
            return;
        }

        for event_type in [
            EventType::UserCreated,
            EventType::UserUpdated,
            EventType::UserDeleted,
            EventType::MessageSent,
        ] {
            let broker = self.broker.clone();
            let id = self.bus.on(
                event_type,
                Arc::new(move |event| {
                    let broker = broker.clone();
                    Box::pin(async move {
                        route(&broker, event).await;
                    })
                }),
            );
            registrations.push(id);
        }
        debug!("Event bridge initialised.");
    }

    /// Removes the bus subscriptions.
    pub fn shutdown(&self) {
        let mut registrations = self
            .registrations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for id in registrations.drain(..) {
            self.bus.off(id);
        }
        debug!("Event bridge shut down.");
    }
}

/// Publishes one event to every topic its namespace convention names.
async fn route(broker: &Broker, event: AppEvent) {
    let metadata: HashMap<String, String> = HashMap::from([
        ("eventType".to_owned(), event.event_type().as_str().to_owned()),
        ("eventId".to_owned(), event.event_id.clone()),
        (
            "timestamp".to_owned(),
            event
                .timestamp
                .to_rfc3339_opts(SecondsFormat::Millis, true),
        ),
    ]);

    let (data, topics) = publications(&event.kind);

    for topic in topics {
        if let Err(error) = broker
            .publish(&topic, data.clone(), metadata.clone())
            .await
        {
            warn!(%error, topic, event_id = %event.event_id, "Bridged publication failed.");
        }
    }
}

/// The bridged payload and the topics it lands on, in publication order.
fn publications(kind: &EventKind) -> (Value, Vec<String>) {
    match kind {
        EventKind::UserCreated { user } => (json!({ "user": user }), vec![USERS_TOPIC.to_owned()]),
        EventKind::UserUpdated { user_id, changes } => (
            json!({ "userId": user_id, "changes": changes }),
            vec![USERS_TOPIC.to_owned(), format!("{USERS_TOPIC}.{user_id}")],
        ),
        EventKind::UserDeleted { user_id } => (
            json!({ "userId": user_id }),
            vec![USERS_TOPIC.to_owned(), format!("{USERS_TOPIC}.{user_id}")],
        ),
        EventKind::MessageSent { message } => {
            let mut topics = vec![MESSAGES_TOPIC.to_owned()];
            if let Some(channel_id) = &message.channel_id {
                topics.push(format!("{MESSAGES_TOPIC}.channel.{channel_id}"));
            }
            if let Some(recipient_id) = &message.recipient_id {
                topics.push(format!("{MESSAGES_TOPIC}.user.{recipient_id}"));
            }
            (json!({ "message": message }), topics)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;
    use crate::events::ChatMessage;
    use crate::pubsub::{MemoryAdapter, PubSubMessage};

    async fn bridge_fixture() -> (Arc<EventBus>, Broker, EventBridge) {
        let broker = Broker::new(Arc::new(MemoryAdapter::new(100)));
        broker.connect().await.unwrap();
        let bus = Arc::new(EventBus::new());
        let bridge = EventBridge::new(Arc::clone(&bus), broker.clone());
        bridge.init();
        (bus, broker, bridge)
    }

    async fn subscribe_collecting(
        broker: &Broker,
        pattern: &str,
    ) -> mpsc::UnboundedReceiver<PubSubMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        broker
            .subscribe(
                pattern,
                Arc::new(move |message| {
                    tx.send(message).ok();
                }),
            )
            .await
            .unwrap();
        rx
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<PubSubMessage>) -> PubSubMessage {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("delivery timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn message_sent_fans_out_to_three_topics() {
        let (bus, broker, _bridge) = bridge_fixture().await;
        let mut all = subscribe_collecting(&broker, MESSAGES_TOPIC).await;
        let mut channel = subscribe_collecting(&broker, "messages.channel.c").await;
        let mut direct = subscribe_collecting(&broker, "messages.user.r").await;

        let event = AppEvent::new(EventKind::MessageSent {
            message: ChatMessage {
                id: "m1".to_owned(),
                sender_id: "u1".to_owned(),
                channel_id: Some("c".to_owned()),
                recipient_id: Some("r".to_owned()),
                content: json!("hello"),
                sent_at: Utc::now(),
            },
        });
        let event_id = event.event_id.clone();
        bus.emit(event);

        for rx in [&mut all, &mut channel, &mut direct] {
            let message = recv(rx).await;
            assert_eq!(message.metadata["eventType"], "message.sent");
            assert_eq!(message.metadata["eventId"], event_id);
            assert!(message.metadata.contains_key("timestamp"));
            assert_eq!(message.data["message"]["id"], "m1");
        }
    }

    #[tokio::test]
    async fn user_updated_targets_the_user_subtopic() {
        let (bus, broker, _bridge) = bridge_fixture().await;
        let mut scoped = subscribe_collecting(&broker, "users.u7").await;

        bus.emit(AppEvent::new(EventKind::UserUpdated {
            user_id: "u7".to_owned(),
            changes: json!({ "username": "renamed" }),
        }));

        let message = recv(&mut scoped).await;
        assert_eq!(message.topic, "users.u7");
        assert_eq!(message.data["changes"]["username"], "renamed");
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let (bus, _broker, bridge) = bridge_fixture().await;
        bridge.init();
        bridge.init();
        assert_eq!(bus.handler_count(), 4);

        bridge.shutdown();
        assert_eq!(bus.handler_count(), 0);
    }

    #[test]
    fn namespace_convention() {
        let message = ChatMessage {
            id: "m".to_owned(),
            sender_id: "s".to_owned(),
            channel_id: None,
            recipient_id: Some("r".to_owned()),
            content: json!(1),
            sent_at: Utc::now(),
        };
        let (_, topics) = publications(&EventKind::MessageSent { message });
        assert_eq!(
            topics,
            vec!["messages".to_owned(), "messages.user.r".to_owned()]
        );
    }
}

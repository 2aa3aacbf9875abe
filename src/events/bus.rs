use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use metrics::counter;
use tracing::{error, trace};

use super::{AppEvent, EventType};

/// Identifier of a bus registration, used to unregister.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct HandlerId(u64);

/// Callback invoked for every emitted event of the subscribed type.
pub type EventHandler = Arc<dyn Fn(AppEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// In-process typed event delivery.
///
/// Delivery is fire-and-forget from the emitter's perspective: every handler
/// runs on its own task, so a slow or panicking handler affects neither its
/// siblings nor the emitter.
pub struct EventBus {
    handlers: Mutex<HashMap<HandlerId, (EventType, EventHandler)>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock_handlers(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<HandlerId, (EventType, EventHandler)>> {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a handler for one event type.
    pub fn on(&self, event_type: EventType, handler: EventHandler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock_handlers().insert(id, (event_type, handler));
        id
    }

    /// Unregisters a handler. Idempotent.
    pub fn off(&self, id: HandlerId) {
        self.lock_handlers().remove(&id);
    }

    /// Delivers an event to every handler registered for its type.
    pub fn emit(&self, event: AppEvent) {
        let matching: Vec<EventHandler> = {
            let handlers = self.lock_handlers();
            handlers
                .values()
                .filter(|(event_type, _)| *event_type == event.event_type())
                .map(|(_, handler)| Arc::clone(handler))
                .collect()
        };

        trace!(
            event_type = %event.event_type(),
            event_id = %event.event_id,
            handlers = matching.len(),
            "Emitting event."
        );
        counter!("courier_events_emitted_total").increment(1);

        for handler in matching {
            let event = event.clone();
            tokio::spawn(async move {
                if std::panic::AssertUnwindSafe(handler(event))
                    .catch_unwind()
                    .await
                    .is_err()
                {
                    counter!("courier_event_handler_panics_total").increment(1);
                    error!("Event handler panicked; registration kept.");
                }
            });
        }
    }

    /// The number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.lock_handlers().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;
    use crate::events::EventKind;

    fn deleted_event(user_id: &str) -> AppEvent {
        AppEvent::new(EventKind::UserDeleted {
            user_id: user_id.to_owned(),
        })
    }

    fn forwarding_handler(tx: mpsc::UnboundedSender<AppEvent>) -> EventHandler {
        Arc::new(move |event| {
            let tx = tx.clone();
            Box::pin(async move {
                tx.send(event).ok();
            })
        })
    }

    #[tokio::test]
    async fn delivers_to_matching_handlers_only() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.on(EventType::UserDeleted, forwarding_handler(tx));
        let (other_tx, mut other_rx) = mpsc::unbounded_channel();
        bus.on(EventType::MessageSent, forwarding_handler(other_tx));

        bus.emit(deleted_event("u1"));

        let event = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type(), EventType::UserDeleted);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn off_is_idempotent_and_stops_delivery() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = bus.on(EventType::UserDeleted, forwarding_handler(tx));

        bus.off(id);
        bus.off(id);
        bus.emit(deleted_event("u1"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(bus.handler_count(), 0);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_affect_siblings() {
        let bus = EventBus::new();
        bus.on(
            EventType::UserDeleted,
            Arc::new(|_| Box::pin(async { panic!("boom") })),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.on(EventType::UserDeleted, forwarding_handler(tx));

        bus.emit(deleted_event("u1"));

        timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bus.handler_count(), 2);
    }
}

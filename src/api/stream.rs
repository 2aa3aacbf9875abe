use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::pubsub::{Broker, PubSubMessage, SubscriptionId};
use crate::Result;

/// A lazy per-client stream over a broker subscription.
///
/// Delivered messages are transformed by the field-specific extractor and
/// yielded in delivery order. Dropping the stream — client disconnect, query
/// error, server shutdown — releases the broker subscription exactly once
/// through the attached guard.
pub struct BrokerStream<T> {
    rx: mpsc::UnboundedReceiver<T>,
    _guard: UnsubscribeGuard,
}

impl<T> Stream for BrokerStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Calls `Broker::unsubscribe` exactly once when dropped.
struct UnsubscribeGuard {
    broker: Broker,
    id: Option<SubscriptionId>,
}

impl Drop for UnsubscribeGuard {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let broker = self.broker.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    trace!(subscription_id = %id, "Releasing subscription for dropped stream.");
                    let _ = broker.unsubscribe(&id).await;
                });
            }
            Err(_) => debug!(
                subscription_id = %id,
                "No runtime at stream drop; subscription released with the adapter."
            ),
        }
    }
}

/// Subscribes to `topic` and exposes the deliveries as a [`BrokerStream`].
///
/// Messages for which `extract` returns `None` are skipped.
pub async fn subscribe_stream<T, F>(
    broker: &Broker,
    topic: &str,
    extract: F,
) -> Result<BrokerStream<T>>
where
    T: Send + 'static,
    F: Fn(PubSubMessage) -> Option<T> + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = Arc::new(move |message: PubSubMessage| {
        if let Some(payload) = extract(message) {
            // A send failure means the consumer is gone; the guard will
            // release the subscription shortly.
            tx.send(payload).ok();
        }
    });

    let id = broker.subscribe(topic, handler).await?;
    Ok(BrokerStream {
        rx,
        _guard: UnsubscribeGuard {
            broker: broker.clone(),
            id: Some(id),
        },
    })
}

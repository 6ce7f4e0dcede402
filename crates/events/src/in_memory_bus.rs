//! In-memory event bus for tests/dev.

use std::sync::{Mutex, mpsc};

use async_trait::async_trait;
use thiserror::Error;

use crate::bus::{EventBus, Subscription};
use crate::event::Event;

#[derive(Debug, Error)]
pub enum InMemoryBusError {
    /// Publish failed due to internal lock poisoning.
    #[error("in-memory event bus lock poisoned")]
    Poisoned,
}

#[derive(Debug)]
struct Subscriber<M> {
    /// `None` receives every message; `Some(t)` only messages of event type `t`.
    event_type: Option<String>,
    sender: mpsc::Sender<M>,
}

/// In-memory pub/sub bus.
///
/// - No IO
/// - Synchronous fan-out in publish order
/// - Type-targeted subscriptions via [`InMemoryEventBus::subscribe_to`]
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    subscribers: Mutex<Vec<Subscriber<M>>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, event_type: Option<String>) -> Subscription<M> {
        let (sender, rx) = mpsc::channel();

        // If the lock is poisoned, we still return a subscription;
        // it just won't receive messages until the process restarts.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(Subscriber { event_type, sender });
        }

        Subscription::new(rx)
    }
}

impl<M: Event> InMemoryEventBus<M> {
    /// Subscribe to messages of one event type only.
    pub fn subscribe_to(&self, event_type: impl Into<String>) -> Subscription<M> {
        self.register(Some(event_type.into()))
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Event,
{
    type Error = InMemoryBusError;

    async fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut subs = self.subscribers.lock().map_err(|_| InMemoryBusError::Poisoned)?;

        // Drop any dead subscribers while publishing.
        subs.retain(|sub| match &sub.event_type {
            Some(t) if t != message.event_type() => true,
            _ => sub.sender.send(message.clone()).is_ok(),
        });

        tracing::trace!(event_type = message.event_type(), "published event");
        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        self.register(None)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::serializable::SerializableEvent;

    #[tokio::test]
    async fn broadcast_subscribers_see_every_event_in_publish_order() {
        let bus = InMemoryEventBus::<SerializableEvent>::new();
        let sub = bus.subscribe();

        bus.publish(SerializableEvent::new("a", json!(1))).await.unwrap();
        bus.publish(SerializableEvent::new("b", json!(2))).await.unwrap();

        let types: Vec<_> = sub.drain().iter().map(|e| e.event_type().to_string()).collect();
        assert_eq!(types, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn targeted_subscribers_only_see_their_event_type() {
        let bus = InMemoryEventBus::<SerializableEvent>::new();
        let placed = bus.subscribe_to("orders.order.placed");
        let shipped = bus.subscribe_to("orders.order.shipped");

        bus.publish(SerializableEvent::new("orders.order.placed", json!({"id": 1})))
            .await
            .unwrap();

        assert_eq!(placed.drain().len(), 1);
        assert!(shipped.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_subscriptions_are_pruned() {
        let bus = InMemoryEventBus::<SerializableEvent>::new();
        drop(bus.subscribe());
        let live = bus.subscribe();

        bus.publish(SerializableEvent::new("a", json!(null))).await.unwrap();

        assert_eq!(live.drain().len(), 1);
        assert_eq!(bus.subscribers.lock().unwrap().len(), 1);
    }
}

//! Event publishing/subscription abstraction (mechanics only).
//!
//! This module provides the **event bus port** - the pub/sub mechanism that
//! tracked entity events are released into once their unit of work commits.
//!
//! ## Design Philosophy
//!
//! The event bus is intentionally **lightweight** and makes minimal assumptions:
//!
//! - **Transport-agnostic**: Works with in-memory channels, brokers, message queues, etc.
//! - **Failures surface**: `publish` errors propagate to the caller (the tracker's drain),
//!   which decides what has and has not been emitted
//! - **No persistence**: Bus is for distribution, not storage

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::serializable::SerializableEvent;

/// A subscription to an event stream.
///
/// Each subscription gets a copy of every message published to the bus that
/// matches its filter (broadcast semantics).
///
/// ## Usage Pattern
///
/// ```ignore
/// let subscription = bus.subscribe_to("orders.order.placed");
///
/// while let Ok(event) = subscription.recv_timeout(Duration::from_secs(1)) {
///     project(event)?;
/// }
/// ```
///
/// Subscriptions are designed for single-threaded consumption.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain every message currently buffered, without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Domain-agnostic event bus (pub/sub port).
///
/// ## Error Handling
///
/// `publish()` can fail (e.g. broker unavailable). Failures are surfaced to the
/// caller unchanged; the bus never retries on its own.
///
/// ## Thread Safety
///
/// The trait requires `Send + Sync`, meaning implementations must be safe to share across
/// threads. Multiple flows can publish concurrently.
#[async_trait]
pub trait EventBus<M>: Send + Sync
where
    M: Send + 'static,
{
    type Error: std::error::Error + Send + Sync + 'static;

    async fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

#[async_trait]
impl<M, B> EventBus<M> for Arc<B>
where
    M: Send + 'static,
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    async fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message).await
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}

/// Publication failure. The bus-specific error, when there is one, is kept as
/// the [`source`](std::error::Error::source).
#[derive(Debug, Error)]
#[error("event publication failed: {message}")]
pub struct PublishError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl PublishError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn from_source(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Object-safe publishing half of an [`EventBus`] carrying [`SerializableEvent`]s.
///
/// Scopes and trackers hold `Arc<dyn EventPublisher>` so they stay independent
/// of the concrete bus type. Every `EventBus<SerializableEvent>` is a publisher.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_event(&self, event: SerializableEvent) -> Result<(), PublishError>;
}

#[async_trait]
impl<B> EventPublisher for B
where
    B: EventBus<SerializableEvent>,
{
    async fn publish_event(&self, event: SerializableEvent) -> Result<(), PublishError> {
        self.publish(event)
            .await
            .map_err(PublishError::from_source)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;
    use std::sync::mpsc;

    use serde_json::json;

    use super::*;

    #[derive(Debug, Error)]
    #[error("broker at {endpoint} refused the connection")]
    struct BrokerDown {
        endpoint: String,
    }

    struct OfflineBus;

    #[async_trait]
    impl EventBus<SerializableEvent> for OfflineBus {
        type Error = BrokerDown;

        async fn publish(&self, _message: SerializableEvent) -> Result<(), Self::Error> {
            Err(BrokerDown {
                endpoint: "amqp://events".to_string(),
            })
        }

        fn subscribe(&self) -> Subscription<SerializableEvent> {
            let (_tx, rx) = mpsc::channel();
            Subscription::new(rx)
        }
    }

    #[tokio::test]
    async fn bus_errors_stay_reachable_as_the_source() {
        let err = OfflineBus
            .publish_event(SerializableEvent::new("orders.order.placed", json!({})))
            .await
            .unwrap_err();

        assert!(err.message().contains("amqp://events"));
        let source = err.source().unwrap();
        let broker = source.downcast_ref::<BrokerDown>().unwrap();
        assert_eq!(broker.endpoint, "amqp://events");
    }

    #[test]
    fn plain_publish_errors_have_no_source() {
        let err = PublishError::new("broker unavailable");
        assert!(err.source().is_none());
        assert_eq!(err.to_string(), "event publication failed: broker unavailable");
    }
}

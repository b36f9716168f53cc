//! In-process broadcast broker.

use async_trait::async_trait;
use dashmap::DashMap;
use ember_core::{Event, EventFilter};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use super::{Broker, BrokerError, Subscription, SUBSCRIPTION_BUFFER};

/// Broker backed by one `tokio::sync::broadcast` channel per topic.
///
/// A subscriber that falls more than `capacity` events behind loses the
/// oldest ones; the loss is logged and delivery continues.
pub struct MemoryBroker {
    topics: DashMap<String, broadcast::Sender<Event>>,
    capacity: usize,
}

impl MemoryBroker {
    /// Creates a broker with a per-topic capacity of 256 events.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// Creates a broker with the given per-topic capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Number of live subscriptions on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map_or(0, |sender| sender.receiver_count())
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Event> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, event: Event) -> Result<(), BrokerError> {
        let delivered = self.sender(topic).send(event).unwrap_or(0);
        trace!(topic, delivered, "published event");
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        filter: EventFilter,
    ) -> Result<Subscription, BrokerError> {
        let mut source = self.sender(topic).subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let cancel = CancellationToken::new();

        let stop = cancel.clone();
        let topic_name = topic.to_string();
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    () = stop.cancelled() => break,
                    received = source.recv() => received,
                };
                match received {
                    Ok(event) if filter.matches(&event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(topic = %topic_name, missed, "subscriber lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription::new(topic, rx, cancel))
    }
}

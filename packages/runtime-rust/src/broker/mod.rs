//! Broadcast event brokers.
//!
//! A broker fans each published event out to every subscriber currently
//! attached to the topic. Delivery is unreliable: nothing is persisted,
//! nothing is acknowledged, a subscriber that is absent or too slow at
//! publish time misses the event, and there is no ordering across publishers.

pub mod hub;
pub mod memory;
pub mod tcp;

use std::sync::Arc;

use async_trait::async_trait;
use ember_core::{BrokerUri, Event, EventFilter, FrameError};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

pub use hub::BrokerHub;
pub use memory::MemoryBroker;
pub use tcp::TcpBroker;

/// Capacity of the per-subscription delivery channel.
pub(crate) const SUBSCRIPTION_BUFFER: usize = 64;

/// Errors raised by broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker at {addr} is unreachable: {source}")]
    Unreachable {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("broker connection failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("broker connection closed")]
    Closed,
}

/// Publish/subscribe access to a broadcast channel.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Publishes `event` on `topic`.
    ///
    /// Returns once the broker has accepted the event for delivery, not once
    /// subscribers have received it. Publishing to a topic nobody listens on
    /// succeeds and the event is discarded.
    async fn publish(&self, topic: &str, event: Event) -> Result<(), BrokerError>;

    /// Subscribes to `topic`. Only events published after this call returns
    /// and passing `filter` are delivered.
    async fn subscribe(&self, topic: &str, filter: EventFilter)
        -> Result<Subscription, BrokerError>;
}

/// A live subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    rx: mpsc::Receiver<Event>,
    _forwarder: DropGuard,
}

impl Subscription {
    /// Wraps a delivery channel fed by a forwarding task that stops when
    /// `cancel` fires. The token is cancelled when the subscription drops.
    pub(crate) fn new(
        topic: impl Into<String>,
        rx: mpsc::Receiver<Event>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            topic: topic.into(),
            rx,
            _forwarder: cancel.drop_guard(),
        }
    }

    /// Topic this subscription listens on.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Waits for the next event. `None` once the broker side has gone away.
    ///
    /// Cancel-safe: dropping the future loses no event.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

/// Builds the broker a URI points at.
///
/// TCP brokers connect lazily, so an unreachable hub surfaces on the first
/// publish or subscribe rather than here.
#[must_use]
pub fn connect(uri: &BrokerUri) -> Arc<dyn Broker> {
    match uri.socket_addr() {
        None => Arc::new(MemoryBroker::new()),
        Some(addr) => Arc::new(TcpBroker::new(addr)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_picks_the_broker_named_by_the_uri() {
        let memory = connect(&"memory://".parse().unwrap());
        memory.publish("chat", Event::new("message")).await.unwrap();

        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let tcp = connect(&format!("tcp://127.0.0.1:{port}").parse().unwrap());
        let err = tcp.publish("chat", Event::new("message")).await.unwrap_err();
        assert!(
            matches!(err, BrokerError::Unreachable { ref addr, .. } if *addr == format!("127.0.0.1:{port}"))
        );
    }
}

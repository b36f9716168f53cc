//! Event dispatcher injection: publishes events to the broadcast channel.

use std::sync::Arc;

use async_trait::async_trait;
use ember_core::Event;
use tracing::debug;

use super::InjectionProvider;
use crate::broker::{Broker, BrokerError};
use crate::container::{Injected, WorkerInfo};

/// Publishes events under the owning service's name as topic.
#[derive(Clone)]
pub struct EventDispatcher {
    broker: Arc<dyn Broker>,
    topic: Arc<str>,
}

impl EventDispatcher {
    /// Dispatcher publishing on `topic` through `broker`.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, topic: Arc<str>) -> Self {
        Self { broker, topic }
    }

    /// Topic events are published on.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publishes `event`. Fire-and-forget: returns once the broker accepted
    /// it, not once anyone received it.
    ///
    /// # Errors
    ///
    /// Returns the broker's error if it refused the event.
    pub async fn dispatch(&self, event: Event) -> Result<(), BrokerError> {
        debug!(topic = %self.topic, event_type = %event.event_type, "dispatching event");
        self.broker.publish(&self.topic, event).await
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

/// Hands each worker a dispatcher bound to the container's broker and service name.
pub struct DispatcherProvider {
    name: &'static str,
}

impl DispatcherProvider {
    /// Creates the provider.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }
}

#[async_trait]
impl InjectionProvider for DispatcherProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn acquire(&self, worker: &WorkerInfo) -> anyhow::Result<Injected> {
        let dispatcher = EventDispatcher::new(Arc::clone(&worker.broker), Arc::clone(&worker.service));
        Ok(Arc::new(dispatcher) as Injected)
    }
}

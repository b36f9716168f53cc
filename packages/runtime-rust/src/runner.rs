//! Runs several service containers against one shared broker.

use std::sync::Arc;

use anyhow::Context as _;
use futures_util::future::select_all;
use futures_util::FutureExt;
use tracing::info;

use crate::broker::{self, Broker};
use crate::config::RuntimeConfig;
use crate::container::{Container, ContainerError, ServiceDefinition};

/// Owns a set of containers. Containers start in registration order and
/// stop in reverse registration order.
pub struct ServiceRunner {
    config: RuntimeConfig,
    broker: Arc<dyn Broker>,
    containers: Vec<Container>,
}

impl ServiceRunner {
    /// Creates a runner whose containers share the broker `config` points at.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        let broker = broker::connect(&config.broker_uri);
        Self::with_broker(config, broker)
    }

    /// Creates a runner around an existing broker.
    #[must_use]
    pub fn with_broker(config: RuntimeConfig, broker: Arc<dyn Broker>) -> Self {
        Self {
            config,
            broker,
            containers: Vec::new(),
        }
    }

    /// The broker every container publishes to and subscribes on.
    #[must_use]
    pub fn broker(&self) -> Arc<dyn Broker> {
        Arc::clone(&self.broker)
    }

    /// Configuration the runner was built with.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Builds a container for `definition` and registers it.
    ///
    /// # Errors
    ///
    /// `InvalidDefinition` if the table is inconsistent or a service with the
    /// same name is already registered.
    pub fn add_service<S: Send + Sync + 'static>(
        &mut self,
        definition: ServiceDefinition<S>,
    ) -> Result<Container, ContainerError> {
        if self.container(definition.name()).is_some() {
            return Err(ContainerError::InvalidDefinition(format!(
                "service `{}` is already registered",
                definition.name()
            )));
        }
        let container = Container::new(
            definition,
            self.config.container.clone(),
            Arc::clone(&self.broker),
        )?;
        self.containers.push(container.clone());
        Ok(container)
    }

    /// Registered containers, in registration order.
    #[must_use]
    pub fn containers(&self) -> &[Container] {
        &self.containers
    }

    /// Looks a container up by service name.
    #[must_use]
    pub fn container(&self, service: &str) -> Option<&Container> {
        self.containers
            .iter()
            .find(|container| container.service_name() == service)
    }

    /// Starts every container in registration order.
    ///
    /// If one fails, the containers already started are stopped again in
    /// reverse order before the error is returned.
    ///
    /// # Errors
    ///
    /// The first container start failure.
    pub async fn start(&self) -> Result<(), ContainerError> {
        for (index, container) in self.containers.iter().enumerate() {
            if let Err(err) = container.start().await {
                for started in self.containers[..index].iter().rev() {
                    started.stop().await;
                }
                return Err(err);
            }
        }
        info!(services = self.containers.len(), "all services running");
        Ok(())
    }

    /// Stops every container in reverse registration order.
    pub async fn stop(&self) {
        for container in self.containers.iter().rev() {
            container.stop().await;
        }
    }

    /// Resolves as soon as any container stops.
    ///
    /// # Errors
    ///
    /// The failure that brought that container down, if any.
    pub async fn wait(&self) -> anyhow::Result<()> {
        if self.containers.is_empty() {
            return Ok(());
        }
        let waits = self.containers.iter().map(|container| container.wait().boxed());
        let (outcome, index, _rest) = select_all(waits).await;
        outcome.with_context(|| {
            format!(
                "service `{}` stopped unexpectedly",
                self.containers[index].service_name()
            )
        })
    }
}

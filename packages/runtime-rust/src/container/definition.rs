//! Service registration table.
//!
//! A `ServiceDefinition` records, for one service instance, which injection
//! providers exist and, per method, the single entrypoint that triggers it and
//! the ordered injections it needs. The table is validated when a container is
//! built from it.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use super::context::WorkerContext;
use super::error::ContainerError;
use crate::entrypoint::EntrypointProvider;
use crate::injection::InjectionProvider;

/// Type-erased method body, already bound to the service instance.
pub(crate) type MethodFn =
    Arc<dyn Fn(WorkerContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// One row of the registration table.
pub(crate) struct MethodEntry {
    pub(crate) name: &'static str,
    pub(crate) entrypoint: Arc<dyn EntrypointProvider>,
    pub(crate) injections: Vec<&'static str>,
    pub(crate) handler: MethodFn,
}

/// Registration table for one service.
pub struct ServiceDefinition<S> {
    pub(crate) name: String,
    pub(crate) service: Arc<S>,
    pub(crate) injections: Vec<Arc<dyn InjectionProvider>>,
    pub(crate) methods: Vec<MethodEntry>,
}

impl<S: Send + Sync + 'static> ServiceDefinition<S> {
    /// Starts a definition owning the service instance.
    #[must_use]
    pub fn new(name: impl Into<String>, service: S) -> Self {
        Self {
            name: name.into(),
            service: Arc::new(service),
            injections: Vec::new(),
            methods: Vec::new(),
        }
    }

    /// Registers an injection provider. Registration order is stop order.
    #[must_use]
    pub fn injection(mut self, provider: impl InjectionProvider) -> Self {
        self.injections.push(Arc::new(provider));
        self
    }

    /// Binds `handler` to `entrypoint`. The listed injections are acquired, in
    /// order, before every invocation.
    #[must_use]
    pub fn method<E, F, Fut>(
        mut self,
        name: &'static str,
        entrypoint: E,
        injections: &[&'static str],
        handler: F,
    ) -> Self
    where
        E: EntrypointProvider,
        F: Fn(Arc<S>, WorkerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let service = Arc::clone(&self.service);
        let handler: MethodFn = Arc::new(move |ctx| handler(Arc::clone(&service), ctx).boxed());
        self.methods.push(MethodEntry {
            name,
            entrypoint: Arc::new(entrypoint),
            injections: injections.to_vec(),
            handler,
        });
        self
    }

    /// Service name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The service instance.
    #[must_use]
    pub fn service(&self) -> &Arc<S> {
        &self.service
    }

    /// Names of the registered methods, in registration order.
    #[must_use]
    pub fn method_names(&self) -> Vec<&'static str> {
        self.methods.iter().map(|entry| entry.name).collect()
    }

    /// Checks the table for duplicate names and undeclared injections.
    ///
    /// # Errors
    ///
    /// Returns `ContainerError::InvalidDefinition` describing the first problem found.
    pub fn validate(&self) -> Result<(), ContainerError> {
        if self.name.is_empty() {
            return Err(ContainerError::InvalidDefinition(
                "service name must not be empty".to_string(),
            ));
        }

        let mut injection_names = HashSet::new();
        for provider in &self.injections {
            if !injection_names.insert(provider.name()) {
                return Err(ContainerError::InvalidDefinition(format!(
                    "injection `{}` registered twice",
                    provider.name()
                )));
            }
        }

        let mut method_names = HashSet::new();
        for entry in &self.methods {
            if !method_names.insert(entry.name) {
                return Err(ContainerError::InvalidDefinition(format!(
                    "method `{}` registered twice",
                    entry.name
                )));
            }
            let mut seen = HashSet::new();
            for injection in &entry.injections {
                if !injection_names.contains(injection) {
                    return Err(ContainerError::InvalidDefinition(format!(
                        "method `{}` needs unregistered injection `{injection}`",
                        entry.name
                    )));
                }
                if !seen.insert(*injection) {
                    return Err(ContainerError::InvalidDefinition(format!(
                        "method `{}` lists injection `{injection}` twice",
                        entry.name
                    )));
                }
            }
        }

        Ok(())
    }
}

//! The service container: owns one service instance and every provider,
//! runs the start/stop lifecycle, and dispatches triggers to workers.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use ember_core::WorkerArgs;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::context::{Injected, WorkerContext, WorkerInfo};
use super::definition::{MethodFn, ServiceDefinition};
use super::error::{ContainerError, WorkerError};
use super::lifecycle::{ContainerState, InFlightGuard, LifecycleController};
use super::tasks::{ManagedTaskHandle, ManagedTasks};
use crate::broker::Broker;
use crate::config::ContainerConfig;
use crate::entrypoint::EntrypointProvider;
use crate::injection::InjectionProvider;

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct Binding {
    method: &'static str,
    entrypoint: Arc<dyn EntrypointProvider>,
    injections: Vec<Arc<dyn InjectionProvider>>,
    handler: MethodFn,
}

struct ContainerInner {
    service_name: Arc<str>,
    instance: Arc<dyn Any + Send + Sync>,
    config: ContainerConfig,
    broker: Arc<dyn Broker>,
    injections: Vec<Arc<dyn InjectionProvider>>,
    bindings: Vec<Binding>,
    lifecycle: LifecycleController,
    tasks: ManagedTasks,
    failure: Mutex<Option<String>>,
}

// ---------------------------------------------------------------------------
// Container
// ---------------------------------------------------------------------------

/// Runtime host for one service instance and its providers.
///
/// Cheap to clone; clones share the same container.
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

impl Container {
    /// Builds a container from a validated registration table.
    ///
    /// Providers are constructed by the caller and reused for every worker
    /// for the container's whole lifetime.
    ///
    /// # Errors
    ///
    /// Returns `ContainerError::InvalidDefinition` if the table is inconsistent.
    pub fn new<S: Send + Sync + 'static>(
        definition: ServiceDefinition<S>,
        config: ContainerConfig,
        broker: Arc<dyn Broker>,
    ) -> Result<Self, ContainerError> {
        definition.validate()?;

        let ServiceDefinition {
            name,
            service,
            injections,
            methods,
        } = definition;

        let bindings = methods
            .into_iter()
            .map(|entry| Binding {
                method: entry.name,
                entrypoint: entry.entrypoint,
                injections: entry
                    .injections
                    .iter()
                    .filter_map(|wanted| {
                        injections
                            .iter()
                            .find(|provider| provider.name() == *wanted)
                            .cloned()
                    })
                    .collect(),
                handler: entry.handler,
            })
            .collect();

        Ok(Self {
            inner: Arc::new(ContainerInner {
                service_name: Arc::from(name),
                instance: service,
                config,
                broker,
                injections,
                bindings,
                lifecycle: LifecycleController::new(),
                tasks: ManagedTasks::new(),
                failure: Mutex::new(None),
            }),
        })
    }

    /// Name of the hosted service.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ContainerState {
        self.inner.lifecycle.state()
    }

    /// The hosted service instance, if it is an `S`.
    #[must_use]
    pub fn service<S: Send + Sync + 'static>(&self) -> Option<Arc<S>> {
        Arc::clone(&self.inner.instance).downcast::<S>().ok()
    }

    /// Number of workers currently running.
    #[must_use]
    pub fn in_flight_workers(&self) -> u64 {
        self.inner.lifecycle.in_flight_count()
    }

    /// Starts every entrypoint in registration order.
    ///
    /// Workers are admitted from the moment starting begins, so an entrypoint
    /// may fire while later ones are still starting. If any entrypoint fails
    /// to start, the container is stopped and the failure returned.
    ///
    /// # Errors
    ///
    /// `AlreadyStarted` if called twice, `EntrypointStart` if an entrypoint fails.
    pub async fn start(&self) -> Result<(), ContainerError> {
        let inner = &self.inner;
        if !inner.lifecycle.begin_starting() {
            return Err(ContainerError::AlreadyStarted {
                service: inner.service_name.to_string(),
            });
        }
        info!(service = %inner.service_name, "starting container");

        for (index, binding) in inner.bindings.iter().enumerate() {
            let ctx = EntrypointContext {
                container: Arc::downgrade(inner),
                binding: index,
                service_name: Arc::clone(&inner.service_name),
                method: binding.method,
                broker: Arc::clone(&inner.broker),
            };
            debug!(
                service = %inner.service_name,
                method = binding.method,
                kind = binding.entrypoint.kind(),
                "starting entrypoint"
            );
            if let Err(source) = binding.entrypoint.start(ctx).await {
                let err = ContainerError::EntrypointStart {
                    kind: binding.entrypoint.kind(),
                    method: binding.method,
                    source,
                };
                error!(service = %inner.service_name, error = %err, "container failed to start");
                *inner.failure.lock() = Some(err.to_string());
                self.stop().await;
                return Err(err);
            }
        }

        inner.lifecycle.set_running();
        info!(service = %inner.service_name, "container running");
        Ok(())
    }

    /// Stops the container. Best effort and idempotent.
    ///
    /// Order: refuse new workers, stop every entrypoint, cancel and join the
    /// managed tasks, wait for in-flight workers, then stop every injection
    /// provider. Provider failures are logged, never returned. Waiting is
    /// bounded by `ContainerConfig::shutdown_timeout`. Concurrent callers
    /// all return once the container is `Stopped`.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if !inner.lifecycle.begin_stopping() {
            inner.lifecycle.wait_stopped().await;
            return;
        }
        info!(service = %inner.service_name, "stopping container");

        let timeout = inner.config.shutdown_timeout;
        let deadline = tokio::time::Instant::now() + timeout;

        for binding in &inner.bindings {
            if let Err(err) = binding.entrypoint.stop().await {
                warn!(
                    service = %inner.service_name,
                    method = binding.method,
                    error = %format!("{err:#}"),
                    "entrypoint failed to stop"
                );
            }
        }

        let aborted = inner.tasks.shutdown(timeout).await;
        if aborted > 0 {
            warn!(service = %inner.service_name, aborted, "managed tasks aborted at shutdown deadline");
        }

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if !inner.lifecycle.wait_for_drain(remaining).await {
            warn!(
                service = %inner.service_name,
                in_flight = inner.lifecycle.in_flight_count(),
                "shutdown deadline expired with workers still running"
            );
        }

        for provider in &inner.injections {
            if let Err(err) = provider.stop().await {
                warn!(
                    service = %inner.service_name,
                    injection = provider.name(),
                    error = %format!("{err:#}"),
                    "injection provider failed to stop"
                );
            }
        }

        inner.lifecycle.set_stopped();
        info!(service = %inner.service_name, "container stopped");
    }

    /// Resolves once the container has stopped.
    ///
    /// # Errors
    ///
    /// Returns the failure that brought the container down, if it did not stop cleanly.
    pub async fn wait(&self) -> anyhow::Result<()> {
        self.inner.lifecycle.wait_stopped().await;
        match self.inner.failure.lock().clone() {
            Some(reason) => Err(anyhow::anyhow!(reason)),
            None => Ok(()),
        }
    }

    /// Spawns a worker for `method` outside of its entrypoint, e.g. from tests
    /// or an operator command.
    ///
    /// # Errors
    ///
    /// `InvalidDefinition` for an unknown method, `Unavailable` while stopping.
    pub fn spawn_worker(&self, method: &str, args: WorkerArgs) -> Result<WorkerHandle, ContainerError> {
        let index = self
            .inner
            .bindings
            .iter()
            .position(|binding| binding.method == method)
            .ok_or_else(|| ContainerError::InvalidDefinition(format!("unknown method `{method}`")))?;
        self.inner.spawn_worker(index, args)
    }

    /// Runs `f` as a container-owned background task.
    ///
    /// `protected` tasks have failures logged and ignored; an unprotected
    /// failure stops the whole container and is reported by `wait()`.
    ///
    /// # Errors
    ///
    /// `Unavailable` once the container is stopping.
    pub fn spawn_managed_background_task<F, Fut>(
        &self,
        name: impl Into<String>,
        protected: bool,
        f: F,
    ) -> Result<ManagedTaskHandle, ContainerError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.spawn_managed_background_task(name, protected, f)
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("service", &self.inner.service_name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ContainerInner {
    fn unavailable(&self) -> ContainerError {
        ContainerError::Unavailable {
            service: self.service_name.to_string(),
        }
    }

    fn spawn_worker(&self, index: usize, args: WorkerArgs) -> Result<WorkerHandle, ContainerError> {
        let guard = self.lifecycle.try_admit().ok_or_else(|| self.unavailable())?;
        let binding = &self.bindings[index];

        let info = WorkerInfo {
            worker_id: Uuid::new_v4(),
            service: Arc::clone(&self.service_name),
            method: binding.method,
            broker: Arc::clone(&self.broker),
        };
        let worker_id = info.worker_id;
        let span = info_span!(
            "worker",
            service = %self.service_name,
            method = binding.method,
            %worker_id
        );

        let handle = tokio::spawn(
            run_worker(
                info,
                args,
                binding.injections.clone(),
                Arc::clone(&binding.handler),
                guard,
            )
            .instrument(span),
        );

        Ok(WorkerHandle { worker_id, handle })
    }

    fn spawn_managed_background_task<F, Fut>(
        self: &Arc<Self>,
        name: impl Into<String>,
        protected: bool,
        f: F,
    ) -> Result<ManagedTaskHandle, ContainerError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if !matches!(
            self.lifecycle.state(),
            ContainerState::Created | ContainerState::Starting | ContainerState::Running
        ) {
            return Err(self.unavailable());
        }

        let container = Arc::downgrade(self);
        Ok(self.tasks.spawn(name, protected, f, move |err| {
            if let Some(inner) = container.upgrade() {
                inner.crash(&err);
            }
        }))
    }

    /// Records a fatal failure and stops the container in the background.
    fn crash(self: Arc<Self>, err: &anyhow::Error) {
        error!(service = %self.service_name, error = %format!("{err:#}"), "container crashed");
        self.failure.lock().get_or_insert_with(|| format!("{err:#}"));
        tokio::spawn(async move {
            Container { inner: self }.stop().await;
        });
    }
}

/// Acquires injections, runs the method, releases injections.
async fn run_worker(
    info: WorkerInfo,
    args: WorkerArgs,
    providers: Vec<Arc<dyn InjectionProvider>>,
    handler: MethodFn,
    _guard: InFlightGuard,
) -> Result<(), WorkerError> {
    let mut injections: Vec<(&'static str, Injected)> = Vec::with_capacity(providers.len());

    for (acquired, provider) in providers.iter().enumerate() {
        match provider.acquire(&info).await {
            Ok(value) => injections.push((provider.name(), value)),
            Err(source) => {
                let err = ContainerError::InjectionAcquisition {
                    injection: provider.name(),
                    source,
                };
                warn!(error = %err, "worker aborted before running");
                release_all(&providers[..acquired], &info).await;
                return Err(WorkerError::Acquisition(err));
            }
        }
    }

    let ctx = WorkerContext::new(info.clone(), args, injections);
    let outcome = match AssertUnwindSafe(handler(ctx)).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(WorkerError::Body(err)),
        Err(_) => Err(WorkerError::Panicked),
    };

    release_all(&providers, &info).await;

    match &outcome {
        Ok(()) => debug!("worker completed"),
        Err(err) => error!(error = %err, "worker failed"),
    }
    outcome
}

async fn release_all(providers: &[Arc<dyn InjectionProvider>], info: &WorkerInfo) {
    for provider in providers.iter().rev() {
        provider.release(info).await;
    }
}

// ---------------------------------------------------------------------------
// WorkerHandle
// ---------------------------------------------------------------------------

/// Handle to one spawned worker. Dropping it detaches the worker.
#[derive(Debug)]
pub struct WorkerHandle {
    worker_id: Uuid,
    handle: JoinHandle<Result<(), WorkerError>>,
}

impl WorkerHandle {
    /// Unique id of the worker.
    #[must_use]
    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    /// Whether the worker has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the worker to finish.
    ///
    /// # Errors
    ///
    /// Returns why the worker did not complete.
    pub async fn join(self) -> Result<(), WorkerError> {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(_) => Err(WorkerError::Panicked),
        }
    }
}

// ---------------------------------------------------------------------------
// EntrypointContext
// ---------------------------------------------------------------------------

/// What an entrypoint gets at `start()`: a non-owning reference back to its
/// container and the method it is bound to.
#[derive(Clone)]
pub struct EntrypointContext {
    container: Weak<ContainerInner>,
    binding: usize,
    service_name: Arc<str>,
    method: &'static str,
    broker: Arc<dyn Broker>,
}

impl EntrypointContext {
    /// Service the entrypoint's container hosts.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Method this entrypoint triggers.
    #[must_use]
    pub fn method(&self) -> &'static str {
        self.method
    }

    /// Broker the container was configured with.
    #[must_use]
    pub fn broker(&self) -> Arc<dyn Broker> {
        Arc::clone(&self.broker)
    }

    /// Spawns a worker for the bound method.
    ///
    /// # Errors
    ///
    /// `Unavailable` once the container is stopping or gone. Callers drop the
    /// trigger and carry on.
    pub fn spawn_worker(&self, args: WorkerArgs) -> Result<WorkerHandle, ContainerError> {
        match self.container.upgrade() {
            Some(inner) => inner.spawn_worker(self.binding, args),
            None => Err(ContainerError::Unavailable {
                service: self.service_name.to_string(),
            }),
        }
    }

    /// Runs `f` as a task owned by the container. See
    /// [`Container::spawn_managed_background_task`].
    ///
    /// # Errors
    ///
    /// `Unavailable` once the container is stopping or gone.
    pub fn spawn_managed_background_task<F, Fut>(
        &self,
        name: impl Into<String>,
        protected: bool,
        f: F,
    ) -> Result<ManagedTaskHandle, ContainerError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        match self.container.upgrade() {
            Some(inner) => inner.spawn_managed_background_task(name, protected, f),
            None => Err(ContainerError::Unavailable {
                service: self.service_name.to_string(),
            }),
        }
    }
}

impl std::fmt::Debug for EntrypointContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntrypointContext")
            .field("service", &self.service_name)
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

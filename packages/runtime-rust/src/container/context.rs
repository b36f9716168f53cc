//! Per-worker context handed explicitly to every service method.

use std::any::{type_name, Any};
use std::sync::Arc;

use ember_core::WorkerArgs;
use uuid::Uuid;

use super::error::ContainerError;
use crate::broker::Broker;

/// A resolved injection value, type-erased for storage in the context.
pub type Injected = Arc<dyn Any + Send + Sync>;

/// Identity of one worker invocation, seen by injection providers.
#[derive(Clone)]
pub struct WorkerInfo {
    /// Unique per worker.
    pub worker_id: Uuid,
    /// Name of the service the container hosts.
    pub service: Arc<str>,
    /// Name of the method being invoked.
    pub method: &'static str,
    /// Broker the container was configured with.
    pub broker: Arc<dyn Broker>,
}

impl std::fmt::Debug for WorkerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerInfo")
            .field("worker_id", &self.worker_id)
            .field("service", &self.service)
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

/// Everything one worker needs: its arguments and its resolved injections.
///
/// Built fresh for each invocation and passed by value, so concurrent workers
/// never share mutable state through the service object.
pub struct WorkerContext {
    info: WorkerInfo,
    args: WorkerArgs,
    injections: Vec<(&'static str, Injected)>,
}

impl WorkerContext {
    pub(crate) fn new(
        info: WorkerInfo,
        args: WorkerArgs,
        injections: Vec<(&'static str, Injected)>,
    ) -> Self {
        Self {
            info,
            args,
            injections,
        }
    }

    /// Unique id of this worker.
    #[must_use]
    pub fn worker_id(&self) -> Uuid {
        self.info.worker_id
    }

    /// Service the worker belongs to.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.info.service
    }

    /// Method being invoked.
    #[must_use]
    pub fn method(&self) -> &'static str {
        self.info.method
    }

    /// Arguments the trigger supplied.
    #[must_use]
    pub fn args(&self) -> &WorkerArgs {
        &self.args
    }

    /// Returns the injection registered under `name`, downcast to `T`.
    ///
    /// # Errors
    ///
    /// `MissingInjection` if the method did not declare `name`,
    /// `InjectionTypeMismatch` if the value is not a `T`.
    pub fn injection<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, ContainerError> {
        let value = self
            .injections
            .iter()
            .find(|(declared, _)| *declared == name)
            .map(|(_, value)| Arc::clone(value))
            .ok_or_else(|| ContainerError::MissingInjection {
                name: name.to_string(),
            })?;

        value
            .downcast::<T>()
            .map_err(|_| ContainerError::InjectionTypeMismatch {
                name: name.to_string(),
                expected: type_name::<T>(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    fn info() -> WorkerInfo {
        WorkerInfo {
            worker_id: Uuid::new_v4(),
            service: Arc::from("chat"),
            method: "handle_stdin",
            broker: Arc::new(MemoryBroker::new()),
        }
    }

    #[test]
    fn typed_injection_lookup() {
        let counter: Injected = Arc::new(7_u32);
        let ctx = WorkerContext::new(
            info(),
            WorkerArgs::positional(["alice"]),
            vec![("counter", counter)],
        );

        assert_eq!(*ctx.injection::<u32>("counter").unwrap(), 7);
        assert_eq!(ctx.args().arg_str(0), Some("alice"));
        assert_eq!(ctx.service(), "chat");
        assert_eq!(ctx.method(), "handle_stdin");
    }

    #[test]
    fn undeclared_and_mistyped_injections() {
        let counter: Injected = Arc::new(7_u32);
        let ctx = WorkerContext::new(info(), WorkerArgs::empty(), vec![("counter", counter)]);

        assert!(matches!(
            ctx.injection::<u32>("stdout"),
            Err(ContainerError::MissingInjection { name }) if name == "stdout"
        ));
        assert!(matches!(
            ctx.injection::<String>("counter"),
            Err(ContainerError::InjectionTypeMismatch { .. })
        ));
    }
}

//! Error taxonomy for containers and workers.

/// Errors raised by a container or while preparing a worker.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    /// Spawn requested while the container is stopping or stopped.
    /// Entrypoints drop the trigger and keep listening.
    #[error("container for service `{service}` is not accepting workers")]
    Unavailable { service: String },

    /// An injection provider could not produce a value for one worker.
    #[error("injection `{injection}` could not be acquired: {source:#}")]
    InjectionAcquisition {
        injection: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// An entrypoint could not begin listening. Fatal to container startup.
    #[error("entrypoint `{kind}` for method `{method}` failed to start: {source:#}")]
    EntrypointStart {
        kind: &'static str,
        method: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// A worker asked for an injection its method did not declare.
    #[error("injection `{name}` is not available to this worker")]
    MissingInjection { name: String },

    /// A worker asked for an injection under the wrong type.
    #[error("injection `{name}` is not a `{expected}`")]
    InjectionTypeMismatch { name: String, expected: &'static str },

    /// The registration table is inconsistent.
    #[error("invalid service definition: {0}")]
    InvalidDefinition(String),

    /// `start()` called on a container that already left the `Created` state.
    #[error("container for service `{service}` was already started")]
    AlreadyStarted { service: String },
}

/// Why a single worker invocation ended without completing.
///
/// None of these affect the entrypoint that spawned the worker or any other
/// worker in flight.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Acquisition(ContainerError),
    #[error("worker body failed: {0:#}")]
    Body(anyhow::Error),
    #[error("worker panicked")]
    Panicked,
}

impl ContainerError {
    /// Returns `true` for the error entrypoints are expected to swallow.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_is_recognised() {
        let err = ContainerError::Unavailable {
            service: "chat".into(),
        };
        assert!(err.is_unavailable());
        assert_eq!(
            err.to_string(),
            "container for service `chat` is not accepting workers"
        );

        let other = ContainerError::MissingInjection {
            name: "user".into(),
        };
        assert!(!other.is_unavailable());
    }

    #[test]
    fn acquisition_error_keeps_cause() {
        let err = ContainerError::InjectionAcquisition {
            injection: "stdout",
            source: anyhow::anyhow!("console closed"),
        };
        assert_eq!(
            err.to_string(),
            "injection `stdout` could not be acquired: console closed"
        );
    }
}

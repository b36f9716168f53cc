//! Service container framework.
//!
//! This module implements the trigger -> worker pipeline:
//!
//! 1. **Registration** (`definition`): `ServiceDefinition` maps each method to one
//!    entrypoint and an ordered list of injections
//! 2. **Lifecycle** (`lifecycle`): `Created -> Starting -> Running -> Stopping -> Stopped`
//! 3. **Dispatch** (`dispatch`): `spawn_worker` acquires injections, runs the method,
//!    releases injections
//! 4. **Background tasks** (`tasks`): listening loops owned and joined by the container

mod dispatch;
pub mod context;
pub mod definition;
pub mod error;
pub mod lifecycle;
pub mod tasks;

pub use dispatch::{Container, EntrypointContext, WorkerHandle};
pub use context::{Injected, WorkerContext, WorkerInfo};
pub use definition::ServiceDefinition;
pub use error::{ContainerError, WorkerError};
pub use lifecycle::ContainerState;
pub use tasks::ManagedTaskHandle;

//! Injection providers: dependencies acquired for each worker.

pub mod dispatcher;
pub mod output;
pub mod session;

use async_trait::async_trait;

use crate::container::{Injected, WorkerInfo};

pub use dispatcher::{DispatcherProvider, EventDispatcher};
pub use output::{MemoryOutput, OutputProvider, OutputSink};
pub use session::{Session, SessionProvider};

/// Supplies one dependency to every worker of a container.
///
/// A provider is built once with the service definition and lives as long as
/// the container. `acquire` runs once per worker; whether it hands out a
/// shared value or a fresh one is the provider's choice.
#[async_trait]
pub trait InjectionProvider: Send + Sync + 'static {
    /// Name methods use to declare and look up this injection.
    fn name(&self) -> &'static str;

    /// Produces the value for one worker.
    async fn acquire(&self, worker: &WorkerInfo) -> anyhow::Result<Injected>;

    /// Called after the worker's method returns or fails.
    async fn release(&self, _worker: &WorkerInfo) {}

    /// Called once when the container stops, after all workers have drained.
    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

//! Entrypoint that fires exactly once, at container start.

use async_trait::async_trait;
use ember_core::WorkerArgs;
use tracing::{debug, trace};

use super::{EntrypointContext, EntrypointProvider};

/// Spawns one worker with fixed arguments during `start()`.
///
/// `start()` waits for that worker to finish, so whatever it does happens
/// before any entrypoint registered after it begins listening. A failed
/// worker does not fail the start.
pub struct OnceEntrypoint {
    args: WorkerArgs,
}

impl OnceEntrypoint {
    /// Fires with `args`.
    #[must_use]
    pub fn new(args: WorkerArgs) -> Self {
        Self { args }
    }
}

impl Default for OnceEntrypoint {
    fn default() -> Self {
        Self::new(WorkerArgs::empty())
    }
}

#[async_trait]
impl EntrypointProvider for OnceEntrypoint {
    fn kind(&self) -> &'static str {
        "once"
    }

    async fn start(&self, ctx: EntrypointContext) -> anyhow::Result<()> {
        match ctx.spawn_worker(self.args.clone()) {
            Ok(worker) => {
                // Failures are already logged by the worker itself.
                let _ = worker.join().await;
            }
            Err(err) if err.is_unavailable() => {
                trace!(method = ctx.method(), "container unavailable, once trigger dropped");
            }
            Err(err) => return Err(err.into()),
        }
        debug!(method = ctx.method(), "once entrypoint fired");
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

//! Entrypoint providers: sources of triggers that spawn workers.
//!
//! Every provider follows `Created -> Started -> Stopped`. While started it
//! usually owns a managed background task that blocks on its stimulus source
//! and calls `EntrypointContext::spawn_worker` once per stimulus.

pub mod event;
pub mod once;
pub mod stdin;

use async_trait::async_trait;

pub use crate::container::EntrypointContext;
pub use event::BroadcastEventEntrypoint;
pub use once::OnceEntrypoint;
pub use stdin::StdinEntrypoint;

/// A trigger source bound to exactly one service method.
#[async_trait]
pub trait EntrypointProvider: Send + Sync + 'static {
    /// Short kind name for logs (`"stdin"`, `"once"`, `"event"`).
    fn kind(&self) -> &'static str;

    /// Begins listening. Called once, in registration order, at container start.
    ///
    /// An error here aborts container startup.
    async fn start(&self, ctx: EntrypointContext) -> anyhow::Result<()>;

    /// Stops listening. Must be idempotent, safe before `start`, and must not
    /// block indefinitely.
    async fn stop(&self) -> anyhow::Result<()>;
}

//! Entrypoint driven by broadcast events.

use async_trait::async_trait;
use ember_core::{EventFilter, WorkerArgs};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, trace, warn};

use super::{EntrypointContext, EntrypointProvider};
use crate::container::ManagedTaskHandle;

/// Fires on every event of type `event_type` published by `source_service`.
///
/// Delivery is broadcast: every started instance, in every container, gets
/// its own copy. It is also unreliable: events published while this
/// entrypoint is not subscribed are never seen, and nothing is redelivered.
/// Each event spawns one worker whose only argument is the event payload.
pub struct BroadcastEventEntrypoint {
    source_service: String,
    event_type: String,
    task: Mutex<Option<ManagedTaskHandle>>,
}

impl BroadcastEventEntrypoint {
    /// Listens for `event_type` events dispatched by `source_service`.
    #[must_use]
    pub fn new(source_service: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            source_service: source_service.into(),
            event_type: event_type.into(),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl EntrypointProvider for BroadcastEventEntrypoint {
    fn kind(&self) -> &'static str {
        "event"
    }

    async fn start(&self, ctx: EntrypointContext) -> anyhow::Result<()> {
        if self.task.lock().is_some() {
            anyhow::bail!("event entrypoint already started");
        }

        // Subscribe before returning so events published after `start()`
        // are guaranteed to reach this entrypoint.
        let mut subscription = ctx
            .broker()
            .subscribe(&self.source_service, EventFilter::of_type(self.event_type.clone()))
            .await?;
        debug!(
            method = ctx.method(),
            topic = %self.source_service,
            event_type = %self.event_type,
            "subscribed to broadcast events"
        );

        let name = format!(
            "{}.{}:event:{}.{}",
            ctx.service_name(),
            ctx.method(),
            self.source_service,
            self.event_type
        );
        let loop_ctx = ctx.clone();
        let handle = ctx.spawn_managed_background_task(name, true, move |cancel| async move {
            loop {
                let event = tokio::select! {
                    () = cancel.cancelled() => break,
                    event = subscription.recv() => event,
                };
                let Some(event) = event else {
                    warn!(method = loop_ctx.method(), "broadcast subscription closed");
                    break;
                };

                let args = WorkerArgs::positional([Value::Object(event.data)]);
                match loop_ctx.spawn_worker(args) {
                    Ok(_worker) => {}
                    Err(err) if err.is_unavailable() => {
                        trace!(method = loop_ctx.method(), "container unavailable, event dropped");
                    }
                    Err(err) => warn!(error = %err, "failed to spawn worker for event"),
                }
            }
            // Dropping the subscription unsubscribes.
            drop(subscription);
            anyhow::Ok(())
        })?;

        *self.task.lock() = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        if let Some(task) = self.task.lock().as_ref() {
            task.cancel();
        }
        Ok(())
    }
}

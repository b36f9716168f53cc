//! Container-owned background tasks.
//!
//! Every listening loop an entrypoint runs is a managed task: the container
//! holds its join handle and a cancellation token so `stop()` can signal it
//! and wait for it, with a deadline.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Handle returned to the code that spawned a managed task.
///
/// Cancelling is idempotent. The container still owns and joins the task.
#[derive(Debug, Clone)]
pub struct ManagedTaskHandle {
    name: String,
    cancel: CancellationToken,
}

impl ManagedTaskHandle {
    /// Name the task was spawned with.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requests cancellation of this task only.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation was requested, for this task or the whole container.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

struct ManagedTask {
    name: String,
    supervisor: JoinHandle<()>,
    body: AbortHandle,
}

/// Set of background tasks owned by one container.
pub struct ManagedTasks {
    root: CancellationToken,
    tasks: Mutex<Vec<ManagedTask>>,
}

impl ManagedTasks {
    /// Creates an empty task set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawns `f` with its own cancellation token, a child of the container's.
    ///
    /// An error or panic in a `protected` task is logged and goes no further.
    /// For an unprotected task it is logged and then handed to `on_crash`.
    pub fn spawn<F, Fut, C>(
        &self,
        name: impl Into<String>,
        protected: bool,
        f: F,
        on_crash: C,
    ) -> ManagedTaskHandle
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
        C: FnOnce(anyhow::Error) + Send + 'static,
    {
        let name = name.into();
        let cancel = self.root.child_token();

        let body = tokio::spawn(f(cancel.clone()));
        let body_abort = body.abort_handle();

        let task_name = name.clone();
        let supervisor = tokio::spawn(async move {
            let failure = match body.await {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err),
                Err(join_err) if join_err.is_panic() => {
                    Some(anyhow::anyhow!("managed task `{task_name}` panicked"))
                }
                // Aborted during shutdown.
                Err(_) => None,
            };

            match failure {
                None => debug!(task = %task_name, "managed task finished"),
                Some(err) if protected => {
                    error!(task = %task_name, error = %format!("{err:#}"), "protected managed task failed");
                }
                Some(err) => {
                    error!(task = %task_name, error = %format!("{err:#}"), "managed task failed");
                    on_crash(err);
                }
            }
        });

        self.tasks.lock().push(ManagedTask {
            name: name.clone(),
            supervisor,
            body: body_abort,
        });

        ManagedTaskHandle { name, cancel }
    }

    /// Number of tasks not yet collected by `shutdown`.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Whether no task is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Cancels every task and waits for each to finish, up to `timeout` in total.
    ///
    /// Tasks still running at the deadline are aborted. Returns how many had
    /// to be aborted.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        self.root.cancel();

        let deadline = tokio::time::Instant::now() + timeout;
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let mut aborted = 0;

        for task in tasks {
            let supervisor_abort = task.supervisor.abort_handle();
            if tokio::time::timeout_at(deadline, task.supervisor).await.is_err() {
                warn!(task = %task.name, "managed task ignored cancellation, aborting");
                task.body.abort();
                supervisor_abort.abort();
                aborted += 1;
            }
        }

        aborted
    }
}

impl Default for ManagedTasks {
    fn default() -> Self {
        Self::new()
    }
}

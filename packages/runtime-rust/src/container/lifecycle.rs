//! Container lifecycle state and in-flight worker tracking.
//!
//! Uses `ArcSwap` for lock-free state transitions and an atomic counter
//! with RAII guards for accurate in-flight worker tracking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Container state, transitioned by the lifecycle controller.
///
/// State machine: Created -> Starting -> Running -> Stopping -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// Built, no entrypoint started yet.
    Created,
    /// Entrypoints are being started. Workers are admitted.
    Starting,
    /// Every entrypoint is listening.
    Running,
    /// Shutdown in progress. New workers are refused.
    Stopping,
    /// Terminal.
    Stopped,
}

impl ContainerState {
    /// Whether `spawn_worker` may admit a new worker in this state.
    #[must_use]
    pub fn admits_workers(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

/// Tracks container state, in-flight workers, and the stopped signal.
#[derive(Debug)]
pub struct LifecycleController {
    state: ArcSwap<ContainerState>,
    in_flight: Arc<AtomicU64>,
    stopped_signal: watch::Sender<bool>,
}

impl LifecycleController {
    /// Creates a controller in the `Created` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            state: ArcSwap::from_pointee(ContainerState::Created),
            in_flight: Arc::new(AtomicU64::new(0)),
            stopped_signal: tx,
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> ContainerState {
        **self.state.load()
    }

    /// Moves `Created -> Starting`. Returns `false` from any other state.
    pub fn begin_starting(&self) -> bool {
        let prev = self.state.rcu(|current| {
            if **current == ContainerState::Created {
                Arc::new(ContainerState::Starting)
            } else {
                Arc::clone(current)
            }
        });
        *prev == ContainerState::Created
    }

    /// Moves `Starting -> Running`. A no-op if shutdown already began.
    pub fn set_running(&self) {
        self.state.rcu(|current| {
            if **current == ContainerState::Starting {
                Arc::new(ContainerState::Running)
            } else {
                Arc::clone(current)
            }
        });
    }

    /// Moves to `Stopping`. Returns `true` only for the caller that made the
    /// transition, so exactly one caller runs the shutdown sequence.
    pub fn begin_stopping(&self) -> bool {
        let prev = self.state.rcu(|current| match **current {
            ContainerState::Stopping | ContainerState::Stopped => Arc::clone(current),
            _ => Arc::new(ContainerState::Stopping),
        });
        !matches!(*prev, ContainerState::Stopping | ContainerState::Stopped)
    }

    /// Moves to `Stopped` and notifies every `wait_stopped` caller.
    pub fn set_stopped(&self) {
        self.state.store(Arc::new(ContainerState::Stopped));
        self.stopped_signal.send_replace(true);
    }

    /// Resolves once the container reaches `Stopped`.
    pub async fn wait_stopped(&self) {
        let mut rx = self.stopped_signal.subscribe();
        // Only errors if the sender is dropped, which cannot outlive `self`.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Admits one worker if the state allows it.
    ///
    /// The counter is bumped before the state check so a concurrent
    /// `wait_for_drain` never misses a worker that was admitted.
    #[must_use]
    pub fn try_admit(&self) -> Option<InFlightGuard> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        };
        if self.state().admits_workers() {
            Some(guard)
        } else {
            None
        }
    }

    /// Returns the current number of in-flight workers.
    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Waits for all in-flight workers to finish, up to the given timeout.
    ///
    /// Returns `true` if every worker finished, `false` if the timeout expired.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                return false;
            }

            // Poll at 10ms intervals to avoid busy-waiting
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that decrements the in-flight counter when dropped.
///
/// Dropped at the end of the worker task, including when the worker panics.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_is_created() {
        let lifecycle = LifecycleController::new();
        assert_eq!(lifecycle.state(), ContainerState::Created);
        assert_eq!(lifecycle.in_flight_count(), 0);
    }

    #[test]
    fn transitions_created_starting_running_stopping_stopped() {
        let lifecycle = LifecycleController::new();

        assert!(lifecycle.begin_starting());
        assert_eq!(lifecycle.state(), ContainerState::Starting);

        lifecycle.set_running();
        assert_eq!(lifecycle.state(), ContainerState::Running);

        assert!(lifecycle.begin_stopping());
        assert_eq!(lifecycle.state(), ContainerState::Stopping);

        lifecycle.set_stopped();
        assert_eq!(lifecycle.state(), ContainerState::Stopped);
    }

    #[test]
    fn begin_starting_only_once() {
        let lifecycle = LifecycleController::new();
        assert!(lifecycle.begin_starting());
        assert!(!lifecycle.begin_starting());
        lifecycle.set_running();
        assert!(!lifecycle.begin_starting());
        assert_eq!(lifecycle.state(), ContainerState::Running);
    }

    #[test]
    fn begin_stopping_is_won_once() {
        let lifecycle = LifecycleController::new();
        lifecycle.begin_starting();
        assert!(lifecycle.begin_stopping());
        assert!(!lifecycle.begin_stopping());
        lifecycle.set_stopped();
        assert!(!lifecycle.begin_stopping());
        assert_eq!(lifecycle.state(), ContainerState::Stopped);
    }

    #[test]
    fn set_running_does_not_resurrect_a_stopping_container() {
        let lifecycle = LifecycleController::new();
        lifecycle.begin_starting();
        lifecycle.begin_stopping();
        lifecycle.set_running();
        assert_eq!(lifecycle.state(), ContainerState::Stopping);
    }

    #[test]
    fn admission_follows_state() {
        let lifecycle = LifecycleController::new();
        assert!(lifecycle.try_admit().is_none());
        assert_eq!(lifecycle.in_flight_count(), 0);

        lifecycle.begin_starting();
        let guard = lifecycle.try_admit().expect("starting admits workers");
        assert_eq!(lifecycle.in_flight_count(), 1);

        lifecycle.begin_stopping();
        assert!(lifecycle.try_admit().is_none());
        assert_eq!(lifecycle.in_flight_count(), 1);

        drop(guard);
        assert_eq!(lifecycle.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn wait_for_drain_immediate_success() {
        let lifecycle = LifecycleController::new();
        assert!(lifecycle.wait_for_drain(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn wait_for_drain_with_active_workers() {
        let lifecycle = LifecycleController::new();
        lifecycle.begin_starting();
        let guard = lifecycle.try_admit().unwrap();

        let guard_handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        assert!(lifecycle.wait_for_drain(Duration::from_secs(2)).await);
        guard_handle.await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_drain_timeout() {
        let lifecycle = LifecycleController::new();
        lifecycle.begin_starting();
        let _guard = lifecycle.try_admit().unwrap();

        assert!(!lifecycle.wait_for_drain(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn wait_stopped_resolves_after_set_stopped() {
        let lifecycle = Arc::new(LifecycleController::new());
        let waiter = {
            let lifecycle = Arc::clone(&lifecycle);
            tokio::spawn(async move { lifecycle.wait_stopped().await })
        };

        lifecycle.begin_stopping();
        lifecycle.set_stopped();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resolve")
            .unwrap();

        // Already stopped: resolves immediately.
        lifecycle.wait_stopped().await;
    }
}

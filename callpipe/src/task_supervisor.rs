use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tokio_util::sync::{CancellationToken, DropGuard, WaitForCancellationFuture};

#[derive(Debug, Default)]
struct TaskSupervisorState {
    running: AtomicU64,
    /// Cancelled when stop is requested.
    stop: CancellationToken,
    /// Cancelled once the last task has finished after a stop.
    stopped: CancellationToken,
}

/// Counts the accept loop and connection tasks of a server so that
/// shutdown can wait for all of them.
///
/// The supervisor itself holds one task slot that is released on stop, so
/// [`all_stopped`](Self::all_stopped) never fires before a stop request.
#[derive(Debug)]
pub struct TaskSupervisor(Arc<TaskSupervisorState>);

/// Keeps one task counted until dropped.
#[derive(Debug)]
pub struct TaskSupervisorGuard(Arc<TaskSupervisorState>);

impl TaskSupervisorState {
    fn start_async_task(self: &Arc<Self>) -> TaskSupervisorGuard {
        self.running.fetch_add(1, Ordering::AcqRel);
        TaskSupervisorGuard(self.clone())
    }

    fn finish_async_task(&self) {
        let running = self.running.fetch_sub(1, Ordering::AcqRel) - 1;
        if running == 0 {
            self.stopped.cancel();
        }
    }
}

impl TaskSupervisor {
    #[must_use]
    pub fn create() -> Self {
        let supervisor = Self(Arc::default());

        let guard = supervisor.start_async_task();
        tokio::spawn(async move {
            guard.stopped().await;
        });

        supervisor
    }

    pub fn stop(&self) {
        self.0.stop.cancel();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.stop.is_cancelled()
    }

    /// Stops the supervisor when the returned guard is dropped.
    #[must_use]
    pub fn drop_guard(&self) -> DropGuard {
        self.0.stop.clone().drop_guard()
    }

    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stop.cancelled()
    }

    pub fn all_stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stopped.cancelled()
    }

    #[must_use]
    pub fn running(&self) -> u64 {
        self.0.running.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn start_async_task(&self) -> TaskSupervisorGuard {
        self.0.start_async_task()
    }
}

impl Drop for TaskSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl TaskSupervisorGuard {
    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stop.cancelled()
    }

    /// A token that fires when stop is requested, for cancellable operations.
    #[must_use]
    pub fn stop_token(&self) -> CancellationToken {
        self.0.stop.clone()
    }

    /// Counts one more task on the same supervisor, e.g. a connection spawned
    /// from the accept loop.
    #[must_use]
    pub fn start_async_task(&self) -> TaskSupervisorGuard {
        self.0.start_async_task()
    }
}

impl Drop for TaskSupervisorGuard {
    fn drop(&mut self) {
        self.0.finish_async_task();
    }
}

//! Task runtime seam.
//!
//! Handlers are spawned through `TaskRuntime` instead of calling
//! `tokio::spawn` directly, so the listener does not care how tasks are
//! scheduled. A task ends by returning; there is no separate "terminate"
//! call.

use std::future::Future;
use tracing::Instrument;

/// Creates independently scheduled units of execution.
pub trait TaskRuntime: Send + Sync + 'static {
    /// Starts `task` in the background. The caller never waits for it.
    fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

/// Spawns tasks on the ambient Tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioRuntime;

impl TaskRuntime for TokioRuntime {
    fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // Detached: the JoinHandle is dropped and the task runs to completion
        tokio::spawn(task.instrument(tracing::debug_span!("task", task = name)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_spawned_task_runs_independently() {
        let (tx, rx) = oneshot::channel();

        TokioRuntime.spawn("test", async move {
            let _ = tx.send(42);
        });

        assert_eq!(rx.await.unwrap(), 42);
    }
}

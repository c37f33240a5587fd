use futures_util::FutureExt;
use std::{borrow::Cow, time::Duration};

use tokio::task::JoinHandle;
use tracing::{debug, trace};

#[derive(Debug)]
pub(crate) struct TaskHandle {
    name: Cow<'static, str>,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub(crate) fn new(name: impl Into<Cow<'static, str>>, handle: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}

/// Background tasks owned by the process, stopped together on shutdown.
#[derive(Debug, Default)]
pub(crate) struct TaskManager {
    tasks: Vec<TaskHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskOutcome {
    Completed,
    Aborted,
}

impl TaskManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, task: TaskHandle) {
        trace!(task = task.name(), "task registered");
        self.tasks.push(task);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Give every task up to `grace` to finish on its own, then abort it.
    pub(crate) async fn shutdown_with_grace(self, grace: Duration) {
        for TaskHandle { name, mut handle } in self.tasks {
            let outcome = if grace.is_zero() {
                handle.abort();
                match handle.await {
                    Ok(()) => TaskOutcome::Completed,
                    Err(_) => TaskOutcome::Aborted,
                }
            } else {
                let sleeper = tokio::time::sleep(grace);
                tokio::pin!(sleeper);
                tokio::select! {
                    res = &mut handle => match res {
                        Ok(()) => TaskOutcome::Completed,
                        Err(err) => {
                            debug!(task = %name, ?err, "task exited with error");
                            TaskOutcome::Aborted
                        }
                    },
                    _ = &mut sleeper => {
                        handle.abort();
                        match handle.await {
                            Ok(()) => TaskOutcome::Completed,
                            Err(_) => TaskOutcome::Aborted,
                        }
                    }
                }
            };
            debug!(task = %name, ?outcome, "task stopped");
        }
    }
}

/// Spawn a background loop that is restarted with exponential backoff if it
/// panics. A normal return ends supervision.
pub(crate) fn spawn_supervised<F, Fut>(name: impl Into<Cow<'static, str>>, mut factory: F) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let name = name.into();
    let task_name = name.clone();
    let handle = tokio::spawn(async move {
        let mut backoff_ms: u64 = 200;
        loop {
            match std::panic::AssertUnwindSafe(factory()).catch_unwind().await {
                Ok(()) => {
                    debug!(task = %task_name, "supervised task completed");
                    break;
                }
                Err(_) => {
                    tracing::error!(task = %task_name, backoff_ms, "supervised task panicked; restarting");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = backoff_ms.saturating_mul(2).min(10_000);
                }
            }
        }
    });
    TaskHandle::new(name, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_tasks_past_grace() {
        let mut tasks = TaskManager::new();
        tasks.push(TaskHandle::new(
            "forever",
            tokio::spawn(std::future::pending::<()>()),
        ));
        tasks.push(TaskHandle::new("quick", tokio::spawn(async {})));
        assert_eq!(tasks.len(), 2);
        tasks.shutdown_with_grace(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn supervised_task_restarts_after_panic() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let task = spawn_supervised("flaky", move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first run fails");
                }
            }
        });
        assert_eq!(task.name(), "flaky");
        task.handle.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}

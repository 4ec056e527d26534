use crate::Result;
use core::time::Duration;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

/// Base delay applied after a failed run, multiplied by the number of
/// consecutive failures.
pub const ERROR_RETRY_BASE: Duration = Duration::from_secs(1);

/// Upper bound for the delay after failed runs.
pub const ERROR_RETRY_MAX: Duration = Duration::from_secs(60);

/// The body of a task. It receives the task's cancellation token and is
/// expected to return promptly once it fires.
pub type TaskFn = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// How a task runs.
#[derive(Clone)]
pub struct TaskParams {
    /// Invoked once per run.
    pub run: TaskFn,
    /// Delay between the end of one successful run and the start of the next.
    ///
    /// A task whose body paces itself (e.g. by sleeping internally) can use a
    /// near-zero interval.
    pub interval: Duration,
}

impl TaskParams {
    pub fn new<F, Fut>(interval: Duration, run: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            run: Arc::new(move |cancel| Box::pin(run(cancel))),
            interval,
        }
    }
}

impl core::fmt::Debug for TaskParams {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskParams")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

struct ManagedTask {
    params: watch::Sender<TaskParams>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ManagedTask {
    async fn stop(self, name: &str) {
        self.cancel.cancel();
        if let Err(err) = self.handle.await {
            tracing::error!(task = name, %err, "Task terminated abnormally");
        }
    }
}

/// A registry of named, cancelable, periodically re-run tasks.
///
/// Each task runs on its own Tokio task: it invokes its body, waits for the
/// configured interval (or a backoff after a failure) and starts over until it
/// is removed. Bodies must return promptly once their token is cancelled;
/// cancellation errors they return are treated as a no-op cycle, never as a
/// failure.
#[derive(Default)]
pub struct TaskManager {
    tasks: Mutex<HashMap<String, ManagedTask>>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the task `name`, or replaces the parameters of an existing one.
    ///
    /// An existing task picks up new parameters at its next run; its current
    /// run is not interrupted. Must be called from within a Tokio runtime.
    pub fn update_or_create(&self, name: impl Into<String>, params: TaskParams) {
        let name = name.into();
        let mut tasks = self.tasks.lock();

        if let Some(task) = tasks.get(&name) {
            if !task.handle.is_finished() {
                task.params.send_replace(params);
                tracing::trace!(task = %name, "Updated task");
                return;
            }
        }

        let (params_tx, params_rx) = watch::channel(params);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_task(name.clone(), params_rx, cancel.clone()));
        tracing::trace!(task = %name, "Started task");

        tasks.insert(
            name,
            ManagedTask {
                params: params_tx,
                cancel,
                handle,
            },
        );
    }

    /// Cancels the task `name` and waits for it to stop. Returns `false` if
    /// no such task exists.
    pub async fn remove_and_wait(&self, name: &str) -> bool {
        let task = self.tasks.lock().remove(name);
        match task {
            Some(task) => {
                task.stop(name).await;
                tracing::trace!(task = name, "Removed task");
                true
            }
            None => false,
        }
    }

    /// Cancels every task and waits for all of them to stop.
    pub async fn remove_all_and_wait(&self) {
        let tasks: Vec<(String, ManagedTask)> = self.tasks.lock().drain().collect();
        if tasks.is_empty() {
            return;
        }

        tracing::debug!(count = tasks.len(), "Stopping all tasks");
        for (_, task) in &tasks {
            task.cancel.cancel();
        }
        futures::future::join_all(tasks.into_iter().map(|(name, task)| async move {
            task.stop(&name).await;
        }))
        .await;
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.lock().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().values() {
            task.cancel.cancel();
        }
    }
}

fn failure_backoff(failures: u32) -> Duration {
    ERROR_RETRY_BASE
        .saturating_mul(failures)
        .min(ERROR_RETRY_MAX)
}

async fn run_task(name: String, mut params: watch::Receiver<TaskParams>, cancel: CancellationToken) {
    let mut failures: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        let current = params.borrow_and_update().clone();

        // The body observes cancellation itself so that removal waits for the
        // in-flight run to wind down.
        let result = (current.run)(cancel.clone()).await;

        let delay = match result {
            Ok(()) => {
                failures = 0;
                current.interval
            }
            Err(err) if err.is_cancelled() => {
                tracing::debug!(task = %name, %err, "Task run cancelled");
                current.interval
            }
            Err(err) => {
                failures = failures.saturating_add(1);
                let backoff = failure_backoff(failures).max(current.interval);
                tracing::warn!(task = %name, %err, failures, ?backoff, "Task run failed");
                backoff
            }
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
            Ok(()) = params.changed() => {}
        }
    }

    tracing::trace!(task = %name, "Task stopped");
}

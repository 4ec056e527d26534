use super::config::KEEP_ALIVE_RUN_INTERVAL;
use crate::{Backend, CanonicalKey, Error, NumericIdentity, Result, TaskManager, TaskParams};
use core::time::Duration;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Name of the keep-alive task that re-asserts `id` while it is in use.
pub fn keep_alive_task_name(id: NumericIdentity) -> String {
    format!("sync-identity ({id})")
}

/// Builds the keep-alive task for `key`: sleep for `interval`, then re-assert
/// the key through the backend.
pub(crate) fn keep_alive_params<B: Backend>(
    backend: Arc<B>,
    key: CanonicalKey,
    interval: Duration,
) -> TaskParams {
    TaskParams::new(KEEP_ALIVE_RUN_INTERVAL, move |cancel: CancellationToken| {
        let backend = Arc::clone(&backend);
        let key = key.clone();
        async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Err(Error::Cancelled { context: "identity re-sync" });
                }
                () = tokio::time::sleep(interval) => {}
            }
            tracing::trace!(%key, "Re-asserting identity");
            backend.renew(&cancel, &key).await
        }
    })
}

/// Process-local use counts of global identities.
///
/// The first reference to an identity arms its keep-alive task and the last
/// release stops it. Counts and task transitions change together under one
/// async lock, which is held while a stopping task winds down. Once
/// [`clear`](Self::clear) has run the table refuses new references.
#[derive(Default)]
pub(crate) struct ReferenceTable {
    state: Mutex<Counts>,
    tasks: TaskManager,
}

#[derive(Default)]
struct Counts {
    by_id: HashMap<NumericIdentity, usize>,
    closed: bool,
}

impl ReferenceTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Takes a reference on `id`, arming its keep-alive task with `arm` on the
    /// first one. Returns the new count.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] if the table was cleared.
    pub(crate) async fn acquire(
        &self,
        id: NumericIdentity,
        arm: impl FnOnce() -> TaskParams,
    ) -> Result<usize> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(Error::NotInitialized);
        }

        let count = state.by_id.entry(id).or_insert(0);
        if *count == 0 {
            self.tasks.update_or_create(keep_alive_task_name(id), arm());
        }
        *count += 1;
        Ok(*count)
    }

    /// Drops a reference on `id`. The last one stops the keep-alive task and
    /// waits for it. Returns `None` if `id` is not referenced.
    pub(crate) async fn release(&self, id: NumericIdentity) -> Option<usize> {
        let mut state = self.state.lock().await;
        let count = state.by_id.get_mut(&id)?;
        *count -= 1;
        if *count > 0 {
            return Some(*count);
        }

        state.by_id.remove(&id);
        self.tasks.remove_and_wait(&keep_alive_task_name(id)).await;
        Some(0)
    }

    /// Forgets every reference, stops every keep-alive task and closes the
    /// table.
    pub(crate) async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.by_id.clear();
        self.tasks.remove_all_and_wait().await;
    }

    pub(crate) async fn count(&self, id: NumericIdentity) -> usize {
        self.state.lock().await.by_id.get(&id).copied().unwrap_or(0)
    }

    pub(crate) fn is_armed(&self, id: NumericIdentity) -> bool {
        self.tasks.contains(&keep_alive_task_name(id))
    }

    pub(crate) fn armed(&self) -> usize {
        self.tasks.len()
    }
}

use crate::{CanonicalKey, Error, IdentityView, NumericIdentity, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

/// A subscription mirroring a remote cluster's identities into the local
/// backend's view.
///
/// The subscription stops when [`RemoteCache::close`] is called, when the
/// owning backend is closed, or when the handle is dropped.
#[derive(Debug)]
pub struct RemoteCache {
    pub(super) view: Arc<RwLock<IdentityView>>,
    pub(super) synced: watch::Receiver<bool>,
    pub(super) cancel: CancellationToken,
    pub(super) task: Option<JoinHandle<()>>,
}

impl RemoteCache {
    /// Waits until the remote key space has been listed once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if `cancel` fires first, or
    /// [`Error::BackendUnavailable`] if the subscription ended before syncing.
    pub async fn wait_for_sync(&self, cancel: &CancellationToken) -> Result<()> {
        let mut synced = self.synced.clone();
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled { context: "remote identity sync" }),
            res = synced.wait_for(|done| *done) => res.map(|_| ()).map_err(|_| Error::BackendUnavailable {
                reason: "remote subscription ended before its initial sync".to_string(),
            }),
        }
    }

    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Number of remote identities currently mirrored.
    pub fn len(&self) -> usize {
        self.view.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.view.read().is_empty()
    }

    pub fn lookup_by_id(&self, id: NumericIdentity) -> Option<CanonicalKey> {
        self.view.read().get_by_id(id).cloned()
    }

    /// Stops mirroring and forgets every remote identity.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                tracing::error!(%err, "Remote identity watcher failed");
            }
        }
        self.view.write().clear();
    }
}

impl Drop for RemoteCache {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

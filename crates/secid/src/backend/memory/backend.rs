use super::{remote::RemoteCache, store::MemoryStore, sync::follow_key_space};
use crate::{
    Backend, BackendConfig, BackendFactory, CanonicalKey, Error, EventSender, IdentityView,
    NumericIdentity, Result,
};
use parking_lot::{Mutex, RwLock};
use std::{collections::HashMap, sync::Arc};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
struct LocalKey {
    id: NumericIdentity,
    refs: usize,
}

/// A node's handle on a [`MemoryStore`].
///
/// The backend keeps its own reference count per key: the node is registered
/// as a holder in the store while at least one local reference exists. A
/// background task follows the store's key space to maintain the synced view
/// used for lookups and to feed allocator events.
#[derive(Debug)]
pub struct MemoryBackend {
    store: MemoryStore,
    config: BackendConfig,
    local_keys: Mutex<HashMap<CanonicalKey, LocalKey>>,
    view: Arc<RwLock<IdentityView>>,
    synced: watch::Receiver<bool>,
    remotes: Mutex<Vec<(CancellationToken, Arc<RwLock<IdentityView>>)>>,
    shutdown: CancellationToken,
    follower: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryBackend {
    /// Creates a backend and starts populating its view from `store`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(store: MemoryStore, config: BackendConfig) -> Self {
        let view = Arc::new(RwLock::new(IdentityView::new()));
        let (synced_tx, synced) = watch::channel(false);
        let shutdown = CancellationToken::new();

        let follower = tokio::spawn(follow_key_space(
            store.clone(),
            config.base_path.clone(),
            store.subscribe(),
            Arc::clone(&view),
            config.events.clone(),
            Arc::new(synced_tx),
            shutdown.child_token(),
        ));

        Self {
            store,
            config,
            local_keys: Mutex::new(HashMap::new()),
            view,
            synced,
            remotes: Mutex::new(Vec::new()),
            shutdown,
            follower: Mutex::new(Some(follower)),
        }
    }

    pub fn node_suffix(&self) -> &str {
        &self.config.node_suffix
    }

    /// Number of local references this node holds on `key`.
    pub fn local_refs(&self, key: &CanonicalKey) -> usize {
        self.local_keys.lock().get(key).map_or(0, |local| local.refs)
    }

    fn events(&self) -> &EventSender {
        &self.config.events
    }
}

impl Backend for MemoryBackend {
    type Remote = MemoryStore;
    type RemoteCache = RemoteCache;

    async fn allocate(
        &self,
        cancel: &CancellationToken,
        key: &CanonicalKey,
    ) -> Result<(NumericIdentity, bool)> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled {
                context: "identity allocation",
            });
        }

        // The store is updated under the `local_keys` lock so that a node is
        // a holder in the store exactly while it has local references.
        let mut local_keys = self.local_keys.lock();
        if let Some(local) = local_keys.get_mut(key) {
            local.refs += 1;
            return Ok((local.id, false));
        }

        let (id, is_new) = self.store.allocate(
            &self.config.base_path,
            key,
            &self.config.node_suffix,
            self.config.min_id,
            self.config.max_id,
            self.config.prefix_mask,
        )?;
        local_keys.insert(key.clone(), LocalKey { id, refs: 1 });

        Ok((id, is_new))
    }

    async fn renew(&self, cancel: &CancellationToken, key: &CanonicalKey) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled {
                context: "identity renewal",
            });
        }

        let local_keys = self.local_keys.lock();
        let id = local_keys
            .get(key)
            .map(|local| local.id)
            .ok_or_else(|| Error::Backend {
                reason: format!("key {key} is not held by node {}", self.config.node_suffix),
            })?;

        self.store.renew(
            &self.config.base_path,
            key,
            id,
            &self.config.node_suffix,
            self.config.master_key_protection,
        )
    }

    async fn release(&self, cancel: &CancellationToken, key: &CanonicalKey) -> Result<bool> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled {
                context: "identity release",
            });
        }
        if !self.store.is_available() {
            return Err(Error::BackendUnavailable {
                reason: "store is unreachable".to_string(),
            });
        }

        let mut local_keys = self.local_keys.lock();
        let local = local_keys.get_mut(key).ok_or_else(|| Error::Backend {
            reason: format!("key {key} is not held by node {}", self.config.node_suffix),
        })?;
        if local.refs > 1 {
            local.refs -= 1;
            return Ok(false);
        }

        let released = self
            .store
            .release(&self.config.base_path, key, &self.config.node_suffix);
        // A vanished master key means the hold is gone too.
        if !matches!(released, Err(Error::BackendUnavailable { .. })) {
            local_keys.remove(key);
        }
        released
    }

    async fn wait_for_initial_sync(&self, cancel: &CancellationToken) -> Result<()> {
        let mut synced = self.synced.clone();
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled { context: "initial identity sync" }),
            res = synced.wait_for(|done| *done) => res.map(|_| ()).map_err(|_| Error::BackendUnavailable {
                reason: "backend closed before its initial sync".to_string(),
            }),
        }
    }

    fn lookup(&self, key: &CanonicalKey) -> Option<NumericIdentity> {
        self.view.read().get(key)
    }

    fn lookup_by_id(&self, id: NumericIdentity) -> Option<CanonicalKey> {
        if let Some(key) = self.view.read().get_by_id(id) {
            return Some(key.clone());
        }
        self.remotes
            .lock()
            .iter()
            .filter(|(cancel, _)| !cancel.is_cancelled())
            .find_map(|(_, view)| view.read().get_by_id(id).cloned())
    }

    fn watch_remote(&self, remote: MemoryStore, prefix: &str) -> RemoteCache {
        let view = Arc::new(RwLock::new(IdentityView::new()));
        let (synced_tx, synced) = watch::channel(false);
        let cancel = self.shutdown.child_token();

        let task = tokio::spawn(follow_key_space(
            remote.clone(),
            prefix.to_string(),
            remote.subscribe(),
            Arc::clone(&view),
            self.events().clone(),
            Arc::new(synced_tx),
            cancel.clone(),
        ));

        let mut remotes = self.remotes.lock();
        remotes.retain(|(cancel, _)| !cancel.is_cancelled());
        remotes.push((cancel.clone(), Arc::clone(&view)));

        tracing::info!(prefix, "Watching remote identities");
        RemoteCache {
            view,
            synced,
            cancel,
            task: Some(task),
        }
    }

    async fn close(&self) {
        self.shutdown.cancel();
        let follower = self.follower.lock().take();
        if let Some(follower) = follower {
            if let Err(err) = follower.await {
                tracing::error!(%err, "Key space follower failed");
            }
        }
        self.remotes.lock().clear();
    }
}

/// A [`MemoryStore`] builds one [`MemoryBackend`] per allocator lifetime.
impl BackendFactory for MemoryStore {
    type Backend = MemoryBackend;

    async fn create(&self, config: BackendConfig) -> Result<MemoryBackend> {
        Ok(MemoryBackend::new(self.clone(), config))
    }
}

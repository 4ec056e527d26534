use super::{
    config::AllocatorConfig,
    gate::{Readiness, ReadinessGate},
    owner::AllocatorOwner,
    refcount::{ReferenceTable, keep_alive_params},
    watcher::IdentityWatcher,
};
use crate::{
    Backend, BackendConfig, BackendFactory, Error, Identity, Labels, LocalIdentityCache,
    NumericIdentity, ReservedIdentities, Result, requires_global_identity,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

type RemoteOf<F> = <<F as BackendFactory>::Backend as Backend>::Remote;
type RemoteCacheOf<F> = <<F as BackendFactory>::Backend as Backend>::RemoteCache;

/// State that exists between `init` and `close`.
struct LiveState<B> {
    backend: Arc<B>,
    local: LocalIdentityCache,
    refs: ReferenceTable,
}

/// Resolves label sets to security identities.
///
/// Reserved and well-known label sets resolve without initialization. Every
/// other allocation needs [`init`](Self::init) to have run: node-scoped label
/// sets go to the local identity cache, the rest to the backend after its
/// initial sync.
///
/// A process-local reference count is kept per global identity. While it is
/// positive, a keep-alive task periodically re-asserts the identity so that it
/// survives garbage collection in the shared store.
///
/// # Example
///
/// ```
/// use secid::{AllocatorConfig, AllocatorOwner, IdentityAllocator, Labels, MemoryStore};
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
///
/// struct Owner;
///
/// impl AllocatorOwner for Owner {
///     fn trigger_policy_updates(&self, _force: bool, _reason: &str) {}
///     fn node_suffix(&self) -> String {
///         "node-1".to_string()
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> secid::Result<()> {
/// let allocator = IdentityAllocator::new(MemoryStore::new(), AllocatorConfig::default())?;
/// allocator.init(Arc::new(Owner)).await?;
///
/// let cancel = CancellationToken::new();
/// let labels: Labels = "k8s:app=frontend".parse()?;
/// let (identity, is_new) = allocator.allocate(&cancel, &labels).await?;
/// assert!(is_new);
///
/// allocator.release(&cancel, &identity).await?;
/// allocator.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct IdentityAllocator<F: BackendFactory> {
    factory: F,
    config: AllocatorConfig,
    /// Serializes `init` and `close`. Holds the watcher of the current
    /// lifetime.
    lifecycle: Mutex<Option<IdentityWatcher>>,
    live: RwLock<Option<Arc<LiveState<F::Backend>>>>,
    gate: ReadinessGate,
    reserved: RwLock<Arc<ReservedIdentities>>,
}

impl<F: BackendFactory> IdentityAllocator<F> {
    /// Creates an uninitialized allocator.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` does not validate.
    pub fn new(factory: F, config: AllocatorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            factory,
            config,
            lifecycle: Mutex::new(None),
            live: RwLock::new(None),
            gate: ReadinessGate::new(),
            reserved: RwLock::new(Arc::new(ReservedIdentities::reserved_only())),
        })
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Sets up the backend and everything that depends on it, then releases
    /// callers waiting for readiness.
    ///
    /// The event watcher starts before the backend is created, so identities
    /// found while the backend populates its initial view reach `owner`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the allocator is already initialized,
    /// or the error of the backend factory. A failed `init` leaves the
    /// allocator uninitialized.
    pub async fn init(&self, owner: Arc<dyn AllocatorOwner>) -> Result<()> {
        let mut watcher_slot = self.lifecycle.lock().await;
        if self.live.read().is_some() {
            return Err(Error::InvalidState {
                reason: "init called on an initialized allocator",
            });
        }

        let node_suffix = owner.node_suffix();
        tracing::info!(
            cluster = %self.config.cluster_name,
            cluster_id = self.config.cluster_id,
            node = %node_suffix,
            "Initializing identity allocator"
        );

        *self.reserved.write() = Arc::new(ReservedIdentities::with_well_known(
            &self.config.cluster_name,
        ));

        let (events, events_rx) = mpsc::channel(self.config.event_buffer);
        let watcher = IdentityWatcher::start(owner, events_rx);

        let backend_config = BackendConfig {
            base_path: self.config.base_path.clone(),
            min_id: self.config.min_id,
            max_id: self.config.max_id,
            prefix_mask: self.config.prefix_mask(),
            node_suffix,
            events: events.clone(),
            master_key_protection: self.config.master_key_protection,
        };
        let backend = match self.factory.create(backend_config).await {
            Ok(backend) => backend,
            Err(err) => {
                tracing::error!(%err, "Failed to create identity backend");
                drop(events);
                watcher.stop().await;
                *self.reserved.write() = Arc::new(ReservedIdentities::reserved_only());
                return Err(err);
            }
        };

        let live = LiveState {
            backend: Arc::new(backend),
            local: LocalIdentityCache::new(
                self.config.local_min_id,
                self.config.local_max_id,
                Some(events),
            ),
            refs: ReferenceTable::new(),
        };
        *self.live.write() = Some(Arc::new(live));
        *watcher_slot = Some(watcher);
        self.gate.mark_ready();

        tracing::info!("Identity allocator initialized");
        Ok(())
    }

    /// Tears down everything `init` set up. A later `init` starts from a clean
    /// slate.
    ///
    /// Held identities stay in the backend's store; only this process's
    /// reference counts and keep-alive tasks are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the allocator is not initialized.
    pub async fn close(&self) -> Result<()> {
        let mut watcher_slot = self.lifecycle.lock().await;
        let live = self.live.write().take();
        let Some(live) = live else {
            return Err(Error::InvalidState {
                reason: "close called on an uninitialized allocator",
            });
        };

        tracing::info!("Closing identity allocator");
        live.refs.clear().await;
        live.backend.close().await;
        if let Some(watcher) = watcher_slot.take() {
            watcher.stop().await;
        }
        self.gate.reset();
        *self.reserved.write() = Arc::new(ReservedIdentities::reserved_only());

        tracing::info!("Identity allocator closed");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.live.read().is_some()
    }

    pub fn readiness(&self) -> Readiness {
        self.gate.state()
    }

    /// The backend of the current lifetime.
    pub fn backend(&self) -> Option<Arc<F::Backend>> {
        self.live().map(|live| Arc::clone(&live.backend))
    }

    /// The reserved and well-known identities currently in effect.
    pub fn reserved_identities(&self) -> Arc<ReservedIdentities> {
        Arc::clone(&self.reserved.read())
    }

    /// Waits until the allocator is initialized and the backend has completed
    /// its initial sync.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if `cancel` fires first.
    pub async fn wait_for_initial_identities(&self, cancel: &CancellationToken) -> Result<()> {
        let live = self.wait_live(cancel).await?;
        live.backend.wait_for_initial_sync(cancel).await
    }

    /// Whether `labels` resolve without the backend, either to a reserved
    /// identity or through the local identity cache.
    pub fn allocation_is_local(&self, labels: &Labels) -> bool {
        self.reserved.read().lookup_by_labels(labels).is_some() || !requires_global_identity(labels)
    }

    /// Resolves `labels` to an identity, creating one if needed. The flag is
    /// `true` if the identity did not exist before.
    ///
    /// Global allocations take a process-local reference that must be given
    /// back with [`release`](Self::release).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if `cancel` fires while waiting for
    /// readiness or the backend, [`Error::NotInitialized`] if the allocator
    /// was closed before the allocation completed, or the backend's error.
    #[tracing::instrument(level = "debug", skip_all, fields(labels = %labels))]
    pub async fn allocate(
        &self,
        cancel: &CancellationToken,
        labels: &Labels,
    ) -> Result<(Identity, bool)> {
        let reserved = self.reserved_identities();
        if let Some(identity) = reserved.lookup_by_labels(labels) {
            tracing::debug!(id = %identity.id(), "Resolved reserved identity");
            return Ok((identity.clone(), false));
        }

        if !requires_global_identity(labels) {
            let live = self.wait_live(cancel).await?;
            let (identity, is_new) = live.local.lookup_or_create(labels)?;
            tracing::debug!(id = %identity.id(), is_new, "Resolved local identity");
            return Ok((identity, is_new));
        }

        let live = self.wait_live(cancel).await?;
        live.backend.wait_for_initial_sync(cancel).await?;

        let key = labels.canonical_key();
        let (id, is_new) = live.backend.allocate(cancel, &key).await?;
        let acquired = live
            .refs
            .acquire(id, || {
                keep_alive_params(
                    Arc::clone(&live.backend),
                    key.clone(),
                    self.config.keep_alive_interval,
                )
            })
            .await;
        let refs = match acquired {
            Ok(refs) => refs,
            Err(err) => {
                // Closed while the backend was allocating; nothing is left
                // to release the hold later.
                if let Err(undo) = live.backend.release(&CancellationToken::new(), &key).await {
                    tracing::warn!(%id, err = %undo, "Failed to undo allocation after close");
                }
                return Err(err);
            }
        };

        tracing::debug!(%id, is_new, refs, "Resolved global identity");
        Ok((Identity::new(id, labels.clone()), is_new))
    }

    /// Gives back an identity obtained from [`allocate`](Self::allocate).
    /// Returns `true` if this was the last use of a global identity anywhere
    /// in the cluster.
    ///
    /// Reserved identities are never released. Releasing a global identity
    /// this process holds no reference on leaves the reference table
    /// untouched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if `cancel` fires while waiting, or the
    /// backend's error. On a backend error the process-local reference is
    /// kept.
    #[tracing::instrument(level = "debug", skip_all, fields(id = %identity.id()))]
    pub async fn release(&self, cancel: &CancellationToken, identity: &Identity) -> Result<bool> {
        if identity.id().is_reserved() {
            return Ok(false);
        }

        if !requires_global_identity(identity.labels()) {
            let live = self.wait_live(cancel).await?;
            return Ok(live.local.release(identity));
        }

        let live = self.wait_live(cancel).await?;
        live.backend.wait_for_initial_sync(cancel).await?;

        let last_use = live
            .backend
            .release(cancel, &identity.labels().canonical_key())
            .await?;
        let refs = live.refs.release(identity.id()).await;

        tracing::debug!(last_use, ?refs, "Released global identity");
        Ok(last_use)
    }

    /// Releases every identity in `identities`. Keeps going past failures and
    /// returns the last error seen.
    ///
    /// # Errors
    ///
    /// Returns the error of the last release that failed.
    pub async fn release_slice(
        &self,
        cancel: &CancellationToken,
        identities: &[Identity],
    ) -> Result<()> {
        let mut last_err = None;
        for identity in identities {
            if let Err(err) = self.release(cancel, identity).await {
                tracing::error!(%identity, %err, "Failed to release identity");
                last_err = Some(err);
            }
        }
        last_err.map_or(Ok(()), Err)
    }

    /// Starts mirroring the identities of another cluster.
    ///
    /// Waits for readiness without a timeout. The returned subscription does
    /// not have to be synced for local allocations to proceed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] if the allocator was closed while
    /// this call was starting.
    pub async fn watch_remote_identities(&self, remote: RemoteOf<F>) -> Result<RemoteCacheOf<F>> {
        self.gate.wait_ready().await;
        let live = self.live().ok_or(Error::NotInitialized)?;
        Ok(live.backend.watch_remote(remote, &self.config.base_path))
    }

    /// Looks up the identity of `labels` without allocating.
    pub fn lookup_identity(&self, labels: &Labels) -> Option<Identity> {
        if let Some(identity) = self.reserved.read().lookup_by_labels(labels) {
            return Some(identity.clone());
        }

        let live = self.live()?;
        if !requires_global_identity(labels) {
            return live.local.lookup(labels);
        }
        live.backend
            .lookup(&labels.canonical_key())
            .map(|id| Identity::new(id, labels.clone()))
    }

    /// Looks up an identity by its numeric value, including identities of
    /// watched remote clusters.
    pub fn lookup_identity_by_id(&self, id: NumericIdentity) -> Option<Identity> {
        if let Some(identity) = self.reserved.read().lookup_by_id(id) {
            return Some(identity.clone());
        }

        let live = self.live()?;
        if id.is_local() {
            return live.local.lookup_by_id(id);
        }
        let key = live.backend.lookup_by_id(id)?;
        match key.to_labels() {
            Ok(labels) => Some(Identity::new(id, labels)),
            Err(err) => {
                tracing::warn!(%id, %key, %err, "Cannot decode identity key");
                None
            }
        }
    }

    /// Number of process-local references held on the global identity `id`.
    pub async fn reference_count(&self, id: NumericIdentity) -> usize {
        match self.live() {
            Some(live) => live.refs.count(id).await,
            None => 0,
        }
    }

    /// Whether a keep-alive task is running for `id`.
    pub fn keep_alive_armed(&self, id: NumericIdentity) -> bool {
        self.live().is_some_and(|live| live.refs.is_armed(id))
    }

    /// Number of keep-alive tasks currently running.
    pub fn keep_alive_tasks(&self) -> usize {
        self.live().map_or(0, |live| live.refs.armed())
    }

    fn live(&self) -> Option<Arc<LiveState<F::Backend>>> {
        self.live.read().clone()
    }

    async fn wait_live(&self, cancel: &CancellationToken) -> Result<Arc<LiveState<F::Backend>>> {
        if let Some(live) = self.live() {
            return Ok(live);
        }
        self.gate.wait(cancel).await?;
        self.live().ok_or(Error::NotInitialized)
    }
}

impl<F: BackendFactory> core::fmt::Debug for IdentityAllocator<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IdentityAllocator")
            .field("config", &self.config)
            .field("readiness", &self.readiness())
            .finish_non_exhaustive()
    }
}

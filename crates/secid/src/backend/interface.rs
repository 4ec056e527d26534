use crate::{CanonicalKey, EventSender, NumericIdentity, Result};
use core::future::Future;
use tokio_util::sync::CancellationToken;

/// Construction-time configuration handed to a [`BackendFactory`].
#[derive(Clone, Debug)]
pub struct BackendConfig {
    /// Key space prefix under which identities are stored.
    pub base_path: String,
    /// Smallest identity (before masking) the backend may hand out.
    pub min_id: u32,
    /// Largest identity (before masking) the backend may hand out.
    pub max_id: u32,
    /// Bits OR-ed into every allocated identity, typically the cluster prefix.
    pub prefix_mask: u32,
    /// Node-specific suffix identifying this node's holds on a key.
    pub node_suffix: String,
    /// Channel receiving every identity the backend learns about, including
    /// those found while populating its initial view.
    pub events: EventSender,
    /// Recreate a master key that disappeared while this node still holds it.
    pub master_key_protection: bool,
}

/// A cluster-wide identity allocation backend.
///
/// All methods taking a [`CancellationToken`] must return promptly once it is
/// cancelled.
pub trait Backend: Send + Sync + 'static {
    /// Handle to another cluster's backend, used for federation.
    type Remote: Send + 'static;

    /// Subscription returned by [`Backend::watch_remote`]. Dropping or closing
    /// it ends the subscription.
    type RemoteCache: Send + 'static;

    /// Returns the identity for `key`, allocating a new one if no node holds
    /// it yet. The flag is `true` if the identity was newly created.
    fn allocate(
        &self,
        cancel: &CancellationToken,
        key: &CanonicalKey,
    ) -> impl Future<Output = Result<(NumericIdentity, bool)>> + Send;

    /// Re-asserts that this node still uses `key`, without taking another
    /// reference. Used by the keep-alive task of long-lived identities.
    fn renew(
        &self,
        cancel: &CancellationToken,
        key: &CanonicalKey,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Drops one reference to `key`. Returns `true` if no holder is left
    /// anywhere in the cluster.
    fn release(
        &self,
        cancel: &CancellationToken,
        key: &CanonicalKey,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Waits until the backend has loaded every identity that existed when it
    /// was created.
    fn wait_for_initial_sync(
        &self,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Looks up `key` in the synced view without allocating.
    fn lookup(&self, key: &CanonicalKey) -> Option<NumericIdentity>;

    /// Looks up `id` in the synced view, including federated clusters.
    fn lookup_by_id(&self, id: NumericIdentity) -> Option<CanonicalKey>;

    /// Starts mirroring the key space under `prefix` of a remote cluster into
    /// this backend's view.
    fn watch_remote(&self, remote: Self::Remote, prefix: &str) -> Self::RemoteCache;

    /// Stops all background work. Identities held by this node are left in
    /// place for the next lifetime to pick up.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Builds a [`Backend`] for one allocator lifetime.
pub trait BackendFactory: Send + Sync + 'static {
    type Backend: Backend;

    fn create(&self, config: BackendConfig) -> impl Future<Output = Result<Self::Backend>> + Send;
}

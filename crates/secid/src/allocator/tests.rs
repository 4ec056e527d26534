use super::*;
use crate::{
    AllocatorEvent, Backend, BackendConfig, BackendFactory, CanonicalKey, Error,
    IDENTITY_KUBE_DNS, Identity, Label, Labels, MemoryBackend, MemoryStore, NumericIdentity,
    RemoteCache, ReservedIdentities, Result,
};
use core::time::Duration;
use parking_lot::Mutex;
use std::{
    collections::BTreeSet,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const NODE: &str = "node-1";

#[derive(Default)]
struct TestOwner {
    triggers: AtomicUsize,
    forced: AtomicBool,
    seen: Mutex<BTreeSet<NumericIdentity>>,
}

impl AllocatorOwner for TestOwner {
    fn trigger_policy_updates(&self, force: bool, _reason: &str) {
        self.forced.store(force, Ordering::SeqCst);
        self.triggers.fetch_add(1, Ordering::SeqCst);
    }

    fn node_suffix(&self) -> String {
        NODE.to_string()
    }

    fn update_identities(&self, changes: &IdentityChanges) {
        self.seen.lock().extend(changes.added.keys().copied());
    }
}

fn labels(input: &str) -> Labels {
    input.parse().unwrap()
}

fn key(input: &str) -> CanonicalKey {
    labels(input).canonical_key()
}

async fn initialized(store: &MemoryStore) -> (Arc<IdentityAllocator<MemoryStore>>, Arc<TestOwner>) {
    let allocator = Arc::new(IdentityAllocator::new(store.clone(), AllocatorConfig::default()).unwrap());
    let owner = Arc::new(TestOwner::default());
    allocator.init(owner.clone()).await.unwrap();
    (allocator, owner)
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn reserved_labels_resolve_without_init() {
    let allocator = IdentityAllocator::new(MemoryStore::new(), AllocatorConfig::default()).unwrap();
    let cancel = CancellationToken::new();
    let host = labels("reserved:host");

    assert!(allocator.allocation_is_local(&host));
    let (identity, is_new) = allocator.allocate(&cancel, &host).await.unwrap();
    assert_eq!(identity.id(), NumericIdentity::new(1));
    assert!(!is_new);

    assert!(!allocator.release(&cancel, &identity).await.unwrap());
    assert_eq!(
        allocator.lookup_identity_by_id(NumericIdentity::new(2)).map(|i| i.labels().to_string()),
        Some("reserved:world".to_string())
    );
    assert!(!allocator.is_initialized());
    assert_eq!(allocator.readiness(), Readiness::Unready);
}

#[tokio::test]
async fn well_known_identities_need_init() {
    let store = MemoryStore::new();
    let allocator = IdentityAllocator::new(store.clone(), AllocatorConfig::default()).unwrap();
    assert!(allocator.reserved_identities().lookup_by_id(IDENTITY_KUBE_DNS).is_none());

    allocator.init(Arc::new(TestOwner::default())).await.unwrap();
    let kube_dns = allocator
        .reserved_identities()
        .lookup_by_id(IDENTITY_KUBE_DNS)
        .cloned()
        .unwrap();

    let (identity, is_new) = allocator
        .allocate(&CancellationToken::new(), kube_dns.labels())
        .await
        .unwrap();
    assert_eq!(identity.id(), IDENTITY_KUBE_DNS);
    assert!(!is_new);
    assert_eq!(allocator.reference_count(IDENTITY_KUBE_DNS).await, 0);
    assert_eq!(store.len(IDENTITIES_PATH), 0);

    allocator.close().await.unwrap();
    assert!(allocator.reserved_identities().lookup_by_id(IDENTITY_KUBE_DNS).is_none());
}

#[tokio::test]
async fn lifecycle_misuse_is_rejected() {
    let allocator = IdentityAllocator::new(MemoryStore::new(), AllocatorConfig::default()).unwrap();
    assert!(matches!(allocator.close().await, Err(Error::InvalidState { .. })));

    allocator.init(Arc::new(TestOwner::default())).await.unwrap();
    let again = allocator.init(Arc::new(TestOwner::default())).await;
    assert!(matches!(again, Err(Error::InvalidState { .. })));

    allocator.close().await.unwrap();
    assert!(matches!(allocator.close().await, Err(Error::InvalidState { .. })));
}

#[test]
fn invalid_config_is_rejected_up_front() {
    let config = AllocatorConfig {
        cluster_id: 300,
        ..AllocatorConfig::default()
    };
    let err = IdentityAllocator::new(MemoryStore::new(), config).unwrap_err();
    assert!(matches!(err, Error::InvalidConfig { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_allocations_share_one_reference_table_entry() {
    let store = MemoryStore::new();
    let (allocator, _owner) = initialized(&store).await;
    let app = labels("k8s:app=foo");

    let callers = (0..3).map(|_| {
        let allocator = Arc::clone(&allocator);
        let app = app.clone();
        tokio::spawn(async move { allocator.allocate(&CancellationToken::new(), &app).await })
    });
    let results: Vec<(Identity, bool)> = futures::future::try_join_all(callers)
        .await
        .unwrap()
        .into_iter()
        .collect::<Result<_>>()
        .unwrap();

    let id = results[0].0.id();
    assert!(results.iter().all(|(identity, _)| identity.id() == id));
    assert_eq!(results.iter().filter(|(_, is_new)| *is_new).count(), 1);
    assert_eq!(allocator.reference_count(id).await, 3);
    assert!(allocator.keep_alive_armed(id));
    assert_eq!(allocator.keep_alive_tasks(), 1);

    let cancel = CancellationToken::new();
    let identity = &results[0].0;
    assert!(!allocator.release(&cancel, identity).await.unwrap());
    assert!(!allocator.release(&cancel, identity).await.unwrap());
    assert_eq!(allocator.reference_count(id).await, 1);
    assert!(allocator.keep_alive_armed(id));

    assert!(allocator.release(&cancel, identity).await.unwrap());
    assert_eq!(allocator.reference_count(id).await, 0);
    assert!(!allocator.keep_alive_armed(id));
    assert!(store.holders(IDENTITIES_PATH, &app.canonical_key()).is_empty());

    // The backend no longer knows the key; the reference table stays at zero.
    assert!(allocator.release(&cancel, identity).await.is_err());
    assert_eq!(allocator.reference_count(id).await, 0);

    allocator.close().await.unwrap();
}

#[tokio::test]
async fn local_labels_use_the_local_cache() {
    let store = MemoryStore::new();
    let (allocator, owner) = initialized(&store).await;
    let cancel = CancellationToken::new();
    let cidr = labels("cidr:10.0.0.0/8");
    assert!(allocator.allocation_is_local(&cidr));

    let (identity, is_new) = allocator.allocate(&cancel, &cidr).await.unwrap();
    assert!(is_new);
    assert!(identity.id().is_local());
    let (again, again_new) = allocator.allocate(&cancel, &cidr).await.unwrap();
    assert_eq!(again.id(), identity.id());
    assert!(!again_new);

    assert_eq!(allocator.reference_count(identity.id()).await, 0);
    assert!(!allocator.keep_alive_armed(identity.id()));
    assert_eq!(store.len(IDENTITIES_PATH), 0);
    assert_eq!(allocator.lookup_identity(&cidr).map(|i| i.id()), Some(identity.id()));

    let id = identity.id();
    eventually(|| owner.seen.lock().contains(&id)).await;
    assert!(owner.forced.load(Ordering::SeqCst));

    assert!(!allocator.release(&cancel, &identity).await.unwrap());
    assert!(allocator.release(&cancel, &identity).await.unwrap());
    assert!(allocator.lookup_identity_by_id(id).is_none());

    allocator.close().await.unwrap();
}

#[tokio::test]
async fn separators_in_label_values_never_share_an_identity() {
    let store = MemoryStore::new();
    let (allocator, _owner) = initialized(&store).await;
    let cancel = CancellationToken::new();
    let sets = [
        Labels::from([Label::new("k8s", "a", "x"), Label::new("k8s", "b", "y")]),
        Labels::from([Label::new("k8s", "a", "x;k8s:b=y")]),
        Labels::from([Label::new("k8s", "a", "x,y")]),
    ];

    let mut held = Vec::new();
    for set in &sets {
        let (identity, is_new) = allocator.allocate(&cancel, set).await.unwrap();
        assert!(is_new, "{set}");
        held.push(identity);
    }
    let ids: BTreeSet<_> = held.iter().map(Identity::id).collect();
    assert_eq!(ids.len(), sets.len());

    for identity in &held {
        let id = identity.id();
        eventually(|| allocator.lookup_identity_by_id(id).is_some()).await;
        let found = allocator.lookup_identity_by_id(id).unwrap();
        assert_eq!(found.labels(), identity.labels());
    }

    allocator.release_slice(&cancel, &held).await.unwrap();
    allocator.close().await.unwrap();
}

#[tokio::test]
async fn callers_before_init_wait_for_it() {
    let store = MemoryStore::new();
    let allocator = Arc::new(IdentityAllocator::new(store.clone(), AllocatorConfig::default()).unwrap());

    let waiters: Vec<_> = ["k8s:app=early", "cidr:192.168.0.0/16"]
        .into_iter()
        .map(|input| {
            let allocator = Arc::clone(&allocator);
            let set = labels(input);
            tokio::spawn(async move { allocator.allocate(&CancellationToken::new(), &set).await })
        })
        .collect();

    let global = Identity::new(NumericIdentity::new(300), labels("k8s:app=unheld"));
    let local = Identity::new(
        NumericIdentity::new(crate::LOCAL_IDENTITY_FLAG | 7),
        labels("cidr:172.16.0.0/12"),
    );
    let releases: Vec<_> = [global, local]
        .into_iter()
        .map(|identity| {
            let allocator = Arc::clone(&allocator);
            tokio::spawn(async move { allocator.release(&CancellationToken::new(), &identity).await })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(waiters.iter().all(|waiter| !waiter.is_finished()));
    assert!(releases.iter().all(|release| !release.is_finished()));

    allocator.init(Arc::new(TestOwner::default())).await.unwrap();
    for waiter in waiters {
        let (identity, is_new) = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(is_new, "{identity}");
    }

    let mut releases = releases.into_iter();
    let global = tokio::time::timeout(Duration::from_secs(5), releases.next().unwrap())
        .await
        .unwrap()
        .unwrap();
    // Reached the backend, which holds nothing for this lifetime.
    assert!(matches!(global, Err(Error::Backend { .. })), "{global:?}");
    let local = tokio::time::timeout(Duration::from_secs(5), releases.next().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(local, Ok(false));

    allocator.close().await.unwrap();
}

#[tokio::test]
async fn well_known_release_never_waits_for_init() {
    let allocator = IdentityAllocator::new(MemoryStore::new(), AllocatorConfig::default()).unwrap();
    let kube_dns = ReservedIdentities::with_well_known(&allocator.config().cluster_name)
        .lookup_by_id(IDENTITY_KUBE_DNS)
        .cloned()
        .unwrap();
    let cancel = CancellationToken::new();
    let release = || {
        tokio::time::timeout(Duration::from_secs(1), allocator.release(&cancel, &kube_dns))
    };

    assert_eq!(release().await.unwrap(), Ok(false));

    allocator.init(Arc::new(TestOwner::default())).await.unwrap();
    assert_eq!(release().await.unwrap(), Ok(false));
    allocator.close().await.unwrap();

    assert_eq!(release().await.unwrap(), Ok(false));
}

#[tokio::test]
async fn waiting_for_init_honours_cancel() {
    let allocator = IdentityAllocator::new(MemoryStore::new(), AllocatorConfig::default()).unwrap();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let err = allocator
        .allocate(&cancel, &labels("k8s:app=late"))
        .await
        .unwrap_err();
    assert!(err.is_cancelled());

    let err = allocator.wait_for_initial_identities(&cancel).await.unwrap_err();
    assert!(err.is_cancelled());

    let held = Identity::new(NumericIdentity::new(300), labels("k8s:app=late"));
    let err = allocator.release(&cancel, &held).await.unwrap_err();
    assert!(err.is_cancelled());
}

#[tokio::test]
async fn global_allocation_waits_for_initial_sync() {
    let store = MemoryStore::new();
    store.set_available(false);
    let (allocator, _owner) = initialized(&store).await;
    assert_eq!(allocator.readiness(), Readiness::Ready);

    let pending = {
        let allocator = Arc::clone(&allocator);
        tokio::spawn(async move {
            allocator
                .allocate(&CancellationToken::new(), &labels("k8s:app=patient"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished());

    // Local identities do not depend on the backend.
    let (local, _) = allocator
        .allocate(&CancellationToken::new(), &labels("cidr:10.1.0.0/16"))
        .await
        .unwrap();
    assert!(local.id().is_local());

    store.set_available(true);
    let (identity, is_new) = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(is_new);
    assert_eq!(allocator.reference_count(identity.id()).await, 1);

    allocator.close().await.unwrap();
}

#[tokio::test]
async fn close_then_init_starts_clean() {
    let store = MemoryStore::new();
    let (allocator, _owner) = initialized(&store).await;
    let cancel = CancellationToken::new();
    let app = labels("k8s:app=restart");

    let (first, is_new) = allocator.allocate(&cancel, &app).await.unwrap();
    assert!(is_new);
    assert_eq!(allocator.reference_count(first.id()).await, 1);

    allocator.close().await.unwrap();
    assert!(!allocator.is_initialized());
    assert_eq!(allocator.readiness(), Readiness::Unready);
    assert_eq!(allocator.reference_count(first.id()).await, 0);
    assert_eq!(allocator.keep_alive_tasks(), 0);
    // The hold survives in the store for the next lifetime.
    assert_eq!(store.holders(IDENTITIES_PATH, &app.canonical_key()), vec![NODE]);

    allocator.init(Arc::new(TestOwner::default())).await.unwrap();
    assert_eq!(allocator.reference_count(first.id()).await, 0);

    let (second, is_new) = allocator.allocate(&cancel, &app).await.unwrap();
    assert_eq!(second.id(), first.id());
    assert!(!is_new);
    assert_eq!(allocator.reference_count(second.id()).await, 1);

    allocator.close().await.unwrap();
}

#[tokio::test]
async fn release_slice_keeps_going_and_reports_the_last_error() {
    let store = MemoryStore::new();
    let (allocator, _owner) = initialized(&store).await;
    let cancel = CancellationToken::new();

    let (one, _) = allocator.allocate(&cancel, &labels("k8s:app=one")).await.unwrap();
    let (three, _) = allocator.allocate(&cancel, &labels("k8s:app=three")).await.unwrap();
    let ghost = Identity::new(NumericIdentity::new(999), labels("k8s:app=ghost"));
    let phantom = Identity::new(NumericIdentity::new(998), labels("k8s:app=phantom"));

    let err = allocator
        .release_slice(&cancel, &[ghost, one.clone(), phantom, three.clone()])
        .await
        .unwrap_err();
    assert!(
        matches!(&err, Error::Backend { reason } if reason.contains("phantom")),
        "{err}"
    );

    assert_eq!(allocator.reference_count(one.id()).await, 0);
    assert_eq!(allocator.reference_count(three.id()).await, 0);
    assert_eq!(allocator.keep_alive_tasks(), 0);

    allocator.release_slice(&cancel, &[]).await.unwrap();
    allocator.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn keep_alive_restores_collected_identities() {
    let store = MemoryStore::new();
    let (allocator, _owner) = initialized(&store).await;
    let app = labels("k8s:app=long-lived");

    let (identity, _) = allocator
        .allocate(&CancellationToken::new(), &app)
        .await
        .unwrap();
    assert!(allocator.keep_alive_armed(identity.id()));

    // Another actor drops this node's hold and the key is collected.
    store.release(IDENTITIES_PATH, &app.canonical_key(), NODE).unwrap();
    assert_eq!(store.collect_garbage(IDENTITIES_PATH), 1);
    assert_eq!(store.len(IDENTITIES_PATH), 0);

    tokio::time::sleep(DEFAULT_KEEP_ALIVE_INTERVAL + Duration::from_secs(1)).await;

    assert_eq!(store.holders(IDENTITIES_PATH, &app.canonical_key()), vec![NODE]);
    assert_eq!(
        store.snapshot(IDENTITIES_PATH).unwrap(),
        vec![(identity.id(), app.canonical_key())]
    );

    allocator.close().await.unwrap();
}

#[tokio::test]
async fn lookups_see_synced_and_remote_identities() {
    let store = MemoryStore::new();
    let remote = MemoryStore::new();
    let remote_key = key("k8s:app=remote");
    let (remote_id, _) = remote
        .allocate(
            IDENTITIES_PATH,
            &remote_key,
            "remote-node",
            256,
            1024,
            NumericIdentity::cluster_prefix(2),
        )
        .unwrap();

    let allocator = Arc::new(IdentityAllocator::new(store.clone(), AllocatorConfig::default()).unwrap());
    let watching = {
        let allocator = Arc::clone(&allocator);
        let remote = remote.clone();
        tokio::spawn(async move { allocator.watch_remote_identities(remote).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!watching.is_finished());

    let owner = Arc::new(TestOwner::default());
    allocator.init(owner.clone()).await.unwrap();
    let cache = watching.await.unwrap().unwrap();
    cache.wait_for_sync(&CancellationToken::new()).await.unwrap();

    let found = allocator.lookup_identity_by_id(remote_id).unwrap();
    assert_eq!(found.labels(), &labels("k8s:app=remote"));
    eventually(|| owner.seen.lock().contains(&remote_id)).await;

    let app = labels("k8s:app=local");
    let (identity, _) = allocator
        .allocate(&CancellationToken::new(), &app)
        .await
        .unwrap();
    eventually(|| allocator.lookup_identity(&app).is_some()).await;
    assert_eq!(allocator.lookup_identity(&app).map(|i| i.id()), Some(identity.id()));

    cache.close().await;
    assert!(allocator.lookup_identity_by_id(remote_id).is_none());
    allocator.close().await.unwrap();
}

#[tokio::test]
async fn unreachable_remote_does_not_block_local_allocation() {
    let store = MemoryStore::new();
    let remote = MemoryStore::new();
    remote.set_available(false);
    let (allocator, _owner) = initialized(&store).await;

    let cache = allocator.watch_remote_identities(remote).await.unwrap();
    assert!(!cache.is_synced());

    let (identity, is_new) = tokio::time::timeout(
        Duration::from_secs(5),
        allocator.allocate(&CancellationToken::new(), &labels("k8s:app=independent")),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(is_new);
    assert!(!identity.id().is_local());

    cache.close().await;
    allocator.close().await.unwrap();
}

/// Announces an identity while the backend is being built and waits until the
/// owner has seen it.
struct AnnouncingFactory {
    store: MemoryStore,
    owner: Arc<TestOwner>,
    announced: NumericIdentity,
}

impl BackendFactory for AnnouncingFactory {
    type Backend = MemoryBackend;

    async fn create(&self, config: BackendConfig) -> Result<MemoryBackend> {
        config
            .events
            .send(AllocatorEvent::upsert(self.announced, key("k8s:app=announced")))
            .await
            .map_err(|err| Error::Backend {
                reason: err.to_string(),
            })?;

        let id = self.announced;
        eventually(|| self.owner.seen.lock().contains(&id)).await;
        Ok(MemoryBackend::new(self.store.clone(), config))
    }
}

#[tokio::test]
async fn events_during_backend_creation_reach_the_owner() {
    let owner = Arc::new(TestOwner::default());
    let factory = AnnouncingFactory {
        store: MemoryStore::new(),
        owner: Arc::clone(&owner),
        announced: NumericIdentity::new(4000),
    };
    let allocator = IdentityAllocator::new(factory, AllocatorConfig::default()).unwrap();

    tokio::time::timeout(Duration::from_secs(10), allocator.init(owner.clone()))
        .await
        .unwrap()
        .unwrap();
    assert!(owner.triggers.load(Ordering::SeqCst) >= 1);

    allocator.close().await.unwrap();
}

struct FlakyFactory {
    store: MemoryStore,
    fail: Arc<AtomicBool>,
}

impl BackendFactory for FlakyFactory {
    type Backend = MemoryBackend;

    async fn create(&self, config: BackendConfig) -> Result<MemoryBackend> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::BackendUnavailable {
                reason: "store is unreachable".to_string(),
            });
        }
        Ok(MemoryBackend::new(self.store.clone(), config))
    }
}

#[tokio::test]
async fn failed_init_leaves_the_allocator_uninitialized() {
    let fail = Arc::new(AtomicBool::new(true));
    let factory = FlakyFactory {
        store: MemoryStore::new(),
        fail: Arc::clone(&fail),
    };
    let allocator = IdentityAllocator::new(factory, AllocatorConfig::default()).unwrap();

    let err = allocator.init(Arc::new(TestOwner::default())).await.unwrap_err();
    assert!(matches!(err, Error::BackendUnavailable { .. }));
    assert!(!allocator.is_initialized());
    assert_eq!(allocator.readiness(), Readiness::Unready);
    assert!(matches!(allocator.close().await, Err(Error::InvalidState { .. })));

    fail.store(false, Ordering::SeqCst);
    allocator.init(Arc::new(TestOwner::default())).await.unwrap();
    assert!(allocator.is_initialized());
    allocator.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn churn_leaves_no_references_behind() {
    let store = MemoryStore::new();
    let (allocator, _owner) = initialized(&store).await;
    let sets = [labels("k8s:app=churn-a"), labels("k8s:app=churn-b")];

    let workers = (0..8).map(|worker| {
        let allocator = Arc::clone(&allocator);
        let set = sets[worker % sets.len()].clone();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            for _ in 0..25 {
                let (identity, _) = allocator.allocate(&cancel, &set).await?;
                tokio::task::yield_now().await;
                allocator.release(&cancel, &identity).await?;
            }
            Result::Ok(())
        })
    });
    for result in futures::future::try_join_all(workers).await.unwrap() {
        result.unwrap();
    }

    for set in &sets {
        let id = allocator.lookup_identity(set).map(|i| i.id());
        if let Some(id) = id {
            assert_eq!(allocator.reference_count(id).await, 0);
        }
        assert!(store.holders(IDENTITIES_PATH, &set.canonical_key()).is_empty());
    }
    assert_eq!(allocator.keep_alive_tasks(), 0);

    allocator.close().await.unwrap();
}

/// Parks every backend allocation until the test lets it through.
struct GatedBackend {
    inner: MemoryBackend,
    entered: Arc<Notify>,
    proceed: Arc<Notify>,
}

impl Backend for GatedBackend {
    type Remote = MemoryStore;
    type RemoteCache = RemoteCache;

    async fn allocate(
        &self,
        cancel: &CancellationToken,
        key: &CanonicalKey,
    ) -> Result<(NumericIdentity, bool)> {
        self.entered.notify_one();
        self.proceed.notified().await;
        self.inner.allocate(cancel, key).await
    }

    async fn renew(&self, cancel: &CancellationToken, key: &CanonicalKey) -> Result<()> {
        self.inner.renew(cancel, key).await
    }

    async fn release(&self, cancel: &CancellationToken, key: &CanonicalKey) -> Result<bool> {
        self.inner.release(cancel, key).await
    }

    async fn wait_for_initial_sync(&self, cancel: &CancellationToken) -> Result<()> {
        self.inner.wait_for_initial_sync(cancel).await
    }

    fn lookup(&self, key: &CanonicalKey) -> Option<NumericIdentity> {
        self.inner.lookup(key)
    }

    fn lookup_by_id(&self, id: NumericIdentity) -> Option<CanonicalKey> {
        self.inner.lookup_by_id(id)
    }

    fn watch_remote(&self, remote: MemoryStore, prefix: &str) -> RemoteCache {
        self.inner.watch_remote(remote, prefix)
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

struct GatedFactory {
    store: MemoryStore,
    entered: Arc<Notify>,
    proceed: Arc<Notify>,
}

impl BackendFactory for GatedFactory {
    type Backend = GatedBackend;

    async fn create(&self, config: BackendConfig) -> Result<GatedBackend> {
        Ok(GatedBackend {
            inner: MemoryBackend::new(self.store.clone(), config),
            entered: Arc::clone(&self.entered),
            proceed: Arc::clone(&self.proceed),
        })
    }
}

#[tokio::test]
async fn allocation_finishing_after_close_fails_and_leaves_no_hold() {
    let store = MemoryStore::new();
    let entered = Arc::new(Notify::new());
    let proceed = Arc::new(Notify::new());
    let factory = GatedFactory {
        store: store.clone(),
        entered: Arc::clone(&entered),
        proceed: Arc::clone(&proceed),
    };
    let allocator = Arc::new(IdentityAllocator::new(factory, AllocatorConfig::default()).unwrap());
    allocator.init(Arc::new(TestOwner::default())).await.unwrap();
    let app = labels("k8s:app=closing");

    let pending = {
        let allocator = Arc::clone(&allocator);
        let app = app.clone();
        tokio::spawn(async move { allocator.allocate(&CancellationToken::new(), &app).await })
    };
    tokio::time::timeout(Duration::from_secs(5), entered.notified())
        .await
        .unwrap();

    allocator.close().await.unwrap();
    proceed.notify_one();

    let result = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.unwrap_err(), Error::NotInitialized);
    assert!(!allocator.is_initialized());
    assert_eq!(allocator.keep_alive_tasks(), 0);
    assert!(store.holders(IDENTITIES_PATH, &app.canonical_key()).is_empty());
}

use crate::{AllocatorEvent, CanonicalKey, Error, NumericIdentity, Result};
use parking_lot::Mutex;
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

/// Capacity of the change feed. Subscribers that fall further behind resync
/// from a full listing.
const CHANGE_FEED_CAPACITY: usize = 1024;

/// A change published by the store.
#[derive(Clone, Debug)]
pub(crate) struct StoreChange {
    pub(crate) prefix: String,
    pub(crate) event: AllocatorEvent,
}

#[derive(Debug)]
struct MasterKey {
    id: NumericIdentity,
    holders: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct KeySpace {
    by_key: HashMap<CanonicalKey, MasterKey>,
    by_id: HashMap<NumericIdentity, CanonicalKey>,
}

#[derive(Debug)]
struct StoreInner {
    spaces: Mutex<HashMap<String, KeySpace>>,
    changes: broadcast::Sender<StoreChange>,
    available: watch::Sender<bool>,
}

/// A shared, in-process key-value store standing in for a cluster's
/// distributed store.
///
/// Cloning is cheap and every clone refers to the same store.
#[derive(Clone, Debug)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        let (available, _) = watch::channel(true);
        Self {
            inner: Arc::new(StoreInner {
                spaces: Mutex::new(HashMap::new()),
                changes,
                available,
            }),
        }
    }

    /// Makes the store reachable or unreachable. While unreachable, every
    /// operation fails with [`Error::BackendUnavailable`] and initial syncs
    /// wait.
    pub fn set_available(&self, available: bool) {
        self.inner.available.send_replace(available);
    }

    pub fn is_available(&self) -> bool {
        *self.inner.available.borrow()
    }

    /// Number of master keys under `prefix`.
    pub fn len(&self, prefix: &str) -> usize {
        self.inner
            .spaces
            .lock()
            .get(prefix)
            .map_or(0, |space| space.by_key.len())
    }

    /// Nodes currently holding `key` under `prefix`.
    pub fn holders(&self, prefix: &str, key: &CanonicalKey) -> Vec<String> {
        self.inner
            .spaces
            .lock()
            .get(prefix)
            .and_then(|space| space.by_key.get(key))
            .map(|master| master.holders.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Removes every master key under `prefix` that no node holds anymore.
    /// Returns the number of keys removed.
    pub fn collect_garbage(&self, prefix: &str) -> usize {
        let removed: Vec<NumericIdentity> = {
            let mut spaces = self.inner.spaces.lock();
            let Some(space) = spaces.get_mut(prefix) else {
                return 0;
            };
            let unused: Vec<CanonicalKey> = space
                .by_key
                .iter()
                .filter(|(_, master)| master.holders.is_empty())
                .map(|(key, _)| key.clone())
                .collect();

            let mut removed = Vec::with_capacity(unused.len());
            for key in unused {
                if let Some(master) = space.by_key.remove(&key) {
                    space.by_id.remove(&master.id);
                    removed.push(master.id);
                }
            }
            removed
        };

        for id in &removed {
            tracing::debug!(identity = %id, prefix, "Garbage collected unused master key");
            self.publish(prefix, AllocatorEvent::delete(*id));
        }
        removed.len()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.inner.changes.subscribe()
    }

    /// Waits until the store is reachable.
    pub(crate) async fn wait_available(&self, cancel: &CancellationToken) -> Result<()> {
        let mut available = self.inner.available.subscribe();
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled { context: "store connection" }),
            res = available.wait_for(|up| *up) => res.map(|_| ()).map_err(|_| Error::BackendUnavailable {
                reason: "store dropped".to_string(),
            }),
        }
    }

    fn ensure_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(Error::BackendUnavailable {
                reason: "store is unreachable".to_string(),
            })
        }
    }

    /// Lists every identity under `prefix`.
    pub(crate) fn snapshot(&self, prefix: &str) -> Result<Vec<(NumericIdentity, CanonicalKey)>> {
        self.ensure_available()?;
        Ok(self
            .inner
            .spaces
            .lock()
            .get(prefix)
            .map(|space| {
                space
                    .by_id
                    .iter()
                    .map(|(id, key)| (*id, key.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Adds `node` as a holder of `key`, creating the master key with the
    /// lowest free identity in `[min_id, max_id]` (OR-ed with `prefix_mask`)
    /// if it does not exist yet.
    pub(crate) fn allocate(
        &self,
        prefix: &str,
        key: &CanonicalKey,
        node: &str,
        min_id: u32,
        max_id: u32,
        prefix_mask: u32,
    ) -> Result<(NumericIdentity, bool)> {
        self.ensure_available()?;

        let id = {
            let mut spaces = self.inner.spaces.lock();
            let space = spaces.entry(prefix.to_string()).or_default();

            if let Some(master) = space.by_key.get_mut(key) {
                master.holders.insert(node.to_string());
                return Ok((master.id, false));
            }

            let id = (min_id..=max_id)
                .map(|candidate| NumericIdentity::new(candidate | prefix_mask))
                .find(|id| !space.by_id.contains_key(id))
                .ok_or(Error::IdentitySpaceExhausted { scope: "global" })?;

            space.by_key.insert(
                key.clone(),
                MasterKey {
                    id,
                    holders: BTreeSet::from([node.to_string()]),
                },
            );
            space.by_id.insert(id, key.clone());
            id
        };

        self.publish(prefix, AllocatorEvent::upsert(id, key.clone()));
        Ok((id, true))
    }

    /// Ensures `node` still holds `key` as `id`. With `protect_master`, a
    /// master key that was garbage collected is recreated with the same
    /// identity.
    pub(crate) fn renew(
        &self,
        prefix: &str,
        key: &CanonicalKey,
        id: NumericIdentity,
        node: &str,
        protect_master: bool,
    ) -> Result<()> {
        self.ensure_available()?;

        {
            let mut spaces = self.inner.spaces.lock();
            let space = spaces.entry(prefix.to_string()).or_default();

            if let Some(master) = space.by_key.get_mut(key) {
                if master.id != id {
                    return Err(Error::Backend {
                        reason: format!("key {key} is now identity {}, expected {id}", master.id),
                    });
                }
                master.holders.insert(node.to_string());
                return Ok(());
            }

            if !protect_master {
                return Err(Error::Backend {
                    reason: format!("master key {key} for identity {id} was removed"),
                });
            }
            if let Some(other) = space.by_id.get(&id) {
                return Err(Error::Backend {
                    reason: format!("identity {id} was re-allocated to {other}"),
                });
            }

            space.by_key.insert(
                key.clone(),
                MasterKey {
                    id,
                    holders: BTreeSet::from([node.to_string()]),
                },
            );
            space.by_id.insert(id, key.clone());
        }

        tracing::info!(identity = %id, key = %key, "Recreated missing master key");
        self.publish(prefix, AllocatorEvent::upsert(id, key.clone()));
        Ok(())
    }

    /// Removes `node` from the holders of `key`. Returns `true` if no holder
    /// is left. The master key itself stays until garbage collection.
    pub(crate) fn release(&self, prefix: &str, key: &CanonicalKey, node: &str) -> Result<bool> {
        self.ensure_available()?;

        let mut spaces = self.inner.spaces.lock();
        let master = spaces
            .get_mut(prefix)
            .and_then(|space| space.by_key.get_mut(key))
            .ok_or_else(|| Error::Backend {
                reason: format!("master key {key} does not exist"),
            })?;
        master.holders.remove(node);
        Ok(master.holders.is_empty())
    }

    fn publish(&self, prefix: &str, event: AllocatorEvent) {
        // No subscribers is fine: nobody is watching this key space yet.
        let _ = self.inner.changes.send(StoreChange {
            prefix: prefix.to_string(),
            event,
        });
    }
}

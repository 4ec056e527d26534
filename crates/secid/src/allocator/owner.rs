use crate::{AllocatorEvent, CanonicalKey, EventKind, NumericIdentity};
use std::collections::{BTreeMap, BTreeSet};

/// Callbacks into the component that owns the allocator, typically the node
/// agent's policy engine.
pub trait AllocatorOwner: Send + Sync + 'static {
    /// Requests a recomputation of policy. Called after every batch of
    /// identity changes with `force = true`.
    fn trigger_policy_updates(&self, force: bool, reason: &str);

    /// Suffix that identifies this node's holds on shared keys.
    fn node_suffix(&self) -> String;

    /// Receives a batch of identity changes before policy is triggered.
    fn update_identities(&self, changes: &IdentityChanges) {
        let _ = changes;
    }
}

/// A coalesced batch of allocator events.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdentityChanges {
    pub added: BTreeMap<NumericIdentity, CanonicalKey>,
    pub deleted: BTreeSet<NumericIdentity>,
}

impl IdentityChanges {
    /// Folds `event` into the batch. Returns `false` for events that carry
    /// nothing to apply (an upsert without a key).
    ///
    /// The batch holds the latest state per identity, so events can arrive in
    /// any order within a batch.
    pub fn collect(&mut self, event: AllocatorEvent) -> bool {
        match event.kind {
            EventKind::Upsert => {
                let Some(key) = event.key else {
                    tracing::warn!(id = %event.id, "Ignoring upsert without a key");
                    return false;
                };
                self.deleted.remove(&event.id);
                self.added.insert(event.id, key);
            }
            EventKind::Delete => {
                self.added.remove(&event.id);
                self.deleted.insert(event.id);
            }
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty()
    }
}

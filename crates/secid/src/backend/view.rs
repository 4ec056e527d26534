use crate::{AllocatorEvent, CanonicalKey, EventKind, NumericIdentity};
use std::collections::HashMap;

/// A bidirectional id/key index of the identities a backend has seen.
#[derive(Debug, Default)]
pub struct IdentityView {
    by_id: HashMap<NumericIdentity, CanonicalKey>,
    by_key: HashMap<CanonicalKey, NumericIdentity>,
}

impl IdentityView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies an event. Returns `true` if the view changed.
    pub fn apply(&mut self, event: &AllocatorEvent) -> bool {
        match (event.kind, &event.key) {
            (EventKind::Upsert, Some(key)) => self.upsert(event.id, key.clone()),
            (EventKind::Upsert, None) => false,
            (EventKind::Delete, _) => self.remove(event.id),
        }
    }

    fn upsert(&mut self, id: NumericIdentity, key: CanonicalKey) -> bool {
        if self.by_id.get(&id) == Some(&key) {
            return false;
        }
        if let Some(old_key) = self.by_id.insert(id, key.clone()) {
            self.by_key.remove(&old_key);
        }
        self.by_key.insert(key, id);
        true
    }

    fn remove(&mut self, id: NumericIdentity) -> bool {
        match self.by_id.remove(&id) {
            Some(key) => {
                self.by_key.remove(&key);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, key: &CanonicalKey) -> Option<NumericIdentity> {
        self.by_key.get(key).copied()
    }

    pub fn get_by_id(&self, id: NumericIdentity) -> Option<&CanonicalKey> {
        self.by_id.get(&id)
    }

    /// Replaces the whole view with `entries`, returning the events that turn
    /// the old view into the new one.
    pub fn replace(
        &mut self,
        entries: impl IntoIterator<Item = (NumericIdentity, CanonicalKey)>,
    ) -> Vec<AllocatorEvent> {
        let fresh: HashMap<_, _> = entries.into_iter().collect();
        let mut events = Vec::new();

        let stale: Vec<_> = self
            .by_id
            .keys()
            .filter(|id| !fresh.contains_key(id))
            .copied()
            .collect();
        for id in stale {
            self.remove(id);
            events.push(AllocatorEvent::delete(id));
        }
        for (id, key) in fresh {
            if self.upsert(id, key.clone()) {
                events.push(AllocatorEvent::upsert(id, key));
            }
        }
        events
    }

    pub fn clear(&mut self) {
        self.by_id.clear();
        self.by_key.clear();
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

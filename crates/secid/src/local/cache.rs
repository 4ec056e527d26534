use crate::{
    AllocatorEvent, CanonicalKey, Error, EventSender, Identity, LOCAL_IDENTITY_FLAG, Labels,
    NumericIdentity, Result,
};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug)]
struct LocalEntry {
    identity: Identity,
    refs: usize,
}

#[derive(Debug)]
struct LocalState {
    by_id: HashMap<NumericIdentity, LocalEntry>,
    by_key: HashMap<CanonicalKey, NumericIdentity>,
    next: u32,
}

/// Allocates identities that are only meaningful on this node.
///
/// Local identities are drawn round-robin from `[min_id, max_id]` and carry
/// [`LOCAL_IDENTITY_FLAG`]. Each identity is reference counted: repeated
/// lookups of the same labels share it, and it is dropped when the last
/// reference is released. Creations and removals are reported on the event
/// channel so they reach the same consumers as global identities.
#[derive(Debug)]
pub struct LocalIdentityCache {
    state: Mutex<LocalState>,
    min_id: u32,
    max_id: u32,
    events: Option<EventSender>,
}

impl LocalIdentityCache {
    /// Creates a cache over `[min_id, max_id]`. Both bounds must be below
    /// [`LOCAL_IDENTITY_FLAG`] and `min_id <= max_id`.
    pub fn new(min_id: u32, max_id: u32, events: Option<EventSender>) -> Self {
        Self {
            state: Mutex::new(LocalState {
                by_id: HashMap::new(),
                by_key: HashMap::new(),
                next: min_id,
            }),
            min_id,
            max_id,
            events,
        }
    }

    /// Returns the identity for `labels`, creating it if needed. The flag is
    /// `true` if the identity was created by this call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IdentitySpaceExhausted`] if every local identity is in
    /// use.
    pub fn lookup_or_create(&self, labels: &Labels) -> Result<(Identity, bool)> {
        let key = labels.canonical_key();
        let mut state = self.state.lock();

        if let Some(id) = state.by_key.get(&key).copied() {
            if let Some(entry) = state.by_id.get_mut(&id) {
                entry.refs += 1;
                return Ok((entry.identity.clone(), false));
            }
        }

        let id = self.next_free_id(&mut state)?;
        let identity = Identity::new(id, labels.clone());
        state.by_key.insert(key.clone(), id);
        state.by_id.insert(
            id,
            LocalEntry {
                identity: identity.clone(),
                refs: 1,
            },
        );
        drop(state);

        tracing::debug!(identity = %id, labels = %labels, "Created local identity");
        self.emit(AllocatorEvent::upsert(id, key));
        Ok((identity, true))
    }

    /// Drops one reference to `identity`. Returns `true` if this was the last
    /// reference and the identity was removed.
    pub fn release(&self, identity: &Identity) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.by_id.get_mut(&identity.id()) else {
            return false;
        };

        if entry.refs > 1 {
            entry.refs -= 1;
            return false;
        }

        if let Some(entry) = state.by_id.remove(&identity.id()) {
            state.by_key.remove(&entry.identity.labels().canonical_key());
        }
        drop(state);

        tracing::debug!(identity = %identity.id(), "Removed local identity");
        self.emit(AllocatorEvent::delete(identity.id()));
        true
    }

    pub fn lookup(&self, labels: &Labels) -> Option<Identity> {
        let state = self.state.lock();
        let id = state.by_key.get(&labels.canonical_key())?;
        state.by_id.get(id).map(|entry| entry.identity.clone())
    }

    pub fn lookup_by_id(&self, id: NumericIdentity) -> Option<Identity> {
        self.state
            .lock()
            .by_id
            .get(&id)
            .map(|entry| entry.identity.clone())
    }

    /// Number of live local identities.
    pub fn len(&self) -> usize {
        self.state.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().by_id.is_empty()
    }

    fn next_free_id(&self, state: &mut LocalState) -> Result<NumericIdentity> {
        let first = state.next;
        loop {
            let candidate = NumericIdentity::new(state.next | LOCAL_IDENTITY_FLAG);
            state.next = if state.next >= self.max_id {
                self.min_id
            } else {
                state.next + 1
            };

            if !state.by_id.contains_key(&candidate) {
                return Ok(candidate);
            }
            if state.next == first {
                return Err(Error::IdentitySpaceExhausted { scope: "local" });
            }
        }
    }

    fn emit(&self, event: AllocatorEvent) {
        let Some(events) = &self.events else {
            return;
        };
        if let Err(err) = events.try_send(event) {
            tracing::warn!(%err, "Unable to deliver local identity event");
        }
    }
}

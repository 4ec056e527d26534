use crate::{CanonicalKey, NumericIdentity};
use tokio::sync::mpsc;

/// Capacity of the event channel created for every allocator lifetime.
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

/// What happened to an identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The identity was created or its key became visible.
    Upsert,
    /// The identity was removed.
    Delete,
}

/// A change to the set of identities known to this node.
///
/// Emitted by backends while populating and following their key space, and by
/// the local identity cache when it creates or drops a local identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocatorEvent {
    pub kind: EventKind,
    pub id: NumericIdentity,
    /// The canonical key of the identity. Always present for upserts.
    pub key: Option<CanonicalKey>,
}

impl AllocatorEvent {
    pub const fn upsert(id: NumericIdentity, key: CanonicalKey) -> Self {
        Self {
            kind: EventKind::Upsert,
            id,
            key: Some(key),
        }
    }

    pub const fn delete(id: NumericIdentity) -> Self {
        Self {
            kind: EventKind::Delete,
            id,
            key: None,
        }
    }
}

pub type EventSender = mpsc::Sender<AllocatorEvent>;
pub type EventReceiver = mpsc::Receiver<AllocatorEvent>;

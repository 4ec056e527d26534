use crate::{Labels, NumericIdentity};
use core::{fmt, hash};

/// A numeric security identity paired with the labels it stands for.
///
/// Identities are immutable once allocated. Two identities are equal if and
/// only if their numeric values are equal; the labels are carried along for
/// callers but do not take part in comparisons.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Identity {
    id: NumericIdentity,
    labels: Labels,
}

impl Identity {
    pub const fn new(id: NumericIdentity, labels: Labels) -> Self {
        Self { id, labels }
    }

    pub const fn id(&self) -> NumericIdentity {
        self.id
    }

    pub const fn labels(&self) -> &Labels {
        &self.labels
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Identity {}

impl hash::Hash for Identity {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.id, self.labels)
    }
}

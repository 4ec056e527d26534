use crate::{CanonicalKey, Error, Label, Result};
use core::{fmt, str::FromStr};
use std::collections::BTreeMap;

/// A set of security labels, indexed by label key.
///
/// At most one label exists per key; inserting a label with an existing key
/// replaces it. Iteration is ordered by key, which makes the canonical
/// encoding independent of insertion order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Labels {
    by_key: BTreeMap<String, Label>,
}

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a label, returning the label it replaced (if any).
    pub fn insert(&mut self, label: Label) -> Option<Label> {
        self.by_key.insert(label.key().to_string(), label)
    }

    pub fn get(&self, key: &str) -> Option<&Label> {
        self.by_key.get(key)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Iterates labels in key order.
    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.by_key.values()
    }

    /// Returns the single label of a one-label set.
    pub fn single(&self) -> Option<&Label> {
        match self.by_key.len() {
            1 => self.by_key.values().next(),
            _ => None,
        }
    }

    /// Encodes the set as the key under which it is allocated.
    ///
    /// Each label is rendered as `source:key=value;` in key order, with
    /// separators inside a component escaped. [`CanonicalKey::to_labels`]
    /// reverses the encoding exactly.
    pub fn canonical_key(&self) -> CanonicalKey {
        let mut out = String::with_capacity(self.by_key.len() * 32);
        for label in self.by_key.values() {
            label.write_canonical(&mut out);
        }
        CanonicalKey::from_encoded(out)
    }
}

impl FromIterator<Label> for Labels {
    fn from_iter<I: IntoIterator<Item = Label>>(iter: I) -> Self {
        let mut labels = Self::new();
        for label in iter {
            labels.insert(label);
        }
        labels
    }
}

impl<const N: usize> From<[Label; N]> for Labels {
    fn from(labels: [Label; N]) -> Self {
        labels.into_iter().collect()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for label in self.by_key.values() {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{label}")?;
        }
        Ok(())
    }
}

/// Parses a list of labels separated by `,` or `;`, such as
/// `k8s:app=foo,k8s:tier=db` or the canonical `k8s:app=foo;k8s:tier=db;`.
impl FromStr for Labels {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        input
            .split([',', ';'])
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::parse::<Label>)
            .collect()
    }
}

use crate::{Error, Label, Labels, Result};
use core::fmt;

/// Prefix marking a separator (or itself) inside a canonical key component.
pub const KEY_ESCAPE: char = '\\';

/// The deterministic encoding of a [`Labels`] set used as the allocation key
/// in the distributed backend.
///
/// Two label sets produce the same key if and only if they have the same
/// members. Build one with [`Labels::canonical_key`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CanonicalKey(String);

impl CanonicalKey {
    pub(crate) const fn from_encoded(encoded: String) -> Self {
        Self(encoded)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decodes the key back into the label set it was built from.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidLabel`] if the key was not produced by
    /// [`Labels::canonical_key`].
    pub fn to_labels(&self) -> Result<Labels> {
        let mut labels = Labels::new();
        let mut parts: [String; 3] = Default::default();
        let mut field = 0;
        let mut chars = self.0.chars();

        while let Some(c) = chars.next() {
            match c {
                KEY_ESCAPE => match chars.next() {
                    Some(escaped) => parts[field].push(escaped),
                    None => return Err(self.malformed("dangling escape")),
                },
                ':' if field == 0 => field = 1,
                '=' if field == 1 => field = 2,
                ';' if field == 2 => {
                    let [source, key, value] = core::mem::take(&mut parts);
                    labels.insert(Label::new(source, key, value));
                    field = 0;
                }
                ':' | '=' | ';' => return Err(self.malformed("unescaped separator")),
                c => parts[field].push(c),
            }
        }

        if field != 0 || !parts[0].is_empty() {
            return Err(self.malformed("truncated label"));
        }
        Ok(labels)
    }

    fn malformed(&self, reason: &'static str) -> Error {
        Error::InvalidLabel {
            input: self.0.clone(),
            reason,
        }
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

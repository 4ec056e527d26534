use crate::{Error, KEY_ESCAPE, Result, SOURCE_UNSPEC};
use core::{fmt, str::FromStr};

/// A single security label: a `key=value` pair tagged with the source that
/// produced it (e.g. `k8s`, `reserved`, `cidr`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Label {
    source: String,
    key: String,
    value: String,
}

impl Label {
    /// Creates a label from its three components.
    pub fn new(source: impl Into<String>, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Writes the label in the form used by canonical keys:
    /// `source:key=value;`. Separators and [`KEY_ESCAPE`] inside a component
    /// are prefixed with [`KEY_ESCAPE`], so distinct labels never share an
    /// encoding.
    pub(crate) fn write_canonical(&self, out: &mut String) {
        push_escaped(out, &self.source);
        out.push(':');
        push_escaped(out, &self.key);
        out.push('=');
        push_escaped(out, &self.value);
        out.push(';');
    }
}

fn push_escaped(out: &mut String, part: &str) {
    for c in part.chars() {
        if matches!(c, KEY_ESCAPE | ':' | '=' | ';') {
            out.push(KEY_ESCAPE);
        }
        out.push(c);
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.value.is_empty() {
            write!(f, "{}:{}", self.source, self.key)
        } else {
            write!(f, "{}:{}={}", self.source, self.key, self.value)
        }
    }
}

/// Parses `source:key=value`, `source:key` or `key=value`.
///
/// A missing source becomes [`SOURCE_UNSPEC`]. The source separator is only
/// recognized before the first `=`, so values may contain `:`.
impl FromStr for Label {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidLabel {
                input: input.to_string(),
                reason: "empty label",
            });
        }

        let (head, value) = match trimmed.split_once('=') {
            Some((head, value)) => (head, value),
            None => (trimmed, ""),
        };

        let (source, key) = match head.split_once(':') {
            Some((source, key)) => (source, key),
            None => (SOURCE_UNSPEC, head),
        };

        if source.is_empty() {
            return Err(Error::InvalidLabel {
                input: input.to_string(),
                reason: "empty source",
            });
        }
        if key.is_empty() {
            return Err(Error::InvalidLabel {
                input: input.to_string(),
                reason: "empty key",
            });
        }
        if key.contains(';') || value.contains(';') {
            return Err(Error::InvalidLabel {
                input: input.to_string(),
                reason: "';' is reserved as the label separator",
            });
        }

        Ok(Self::new(source, key, value))
    }
}

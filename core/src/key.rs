//! Keys naming logical resources.
//!
//! A [`Key`] is compared by exact string equality. No trimming, case folding
//! or other normalization is applied, so `"A"` and `"a "` are distinct keys.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Opaque identifier of a keyed resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(String);

impl Key {
    /// Create a key from anything string-like
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Borrow the key as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the key, returning the underlying string
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for Key {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_exact_equality() {
        assert_eq!(Key::from("A"), Key::new(String::from("A")));
        assert_ne!(Key::from("A"), Key::from("a"));
        assert_ne!(Key::from("A"), Key::from("A "));
    }

    #[test]
    fn test_lookup_by_str() {
        let mut map = HashMap::new();
        map.insert(Key::from("user:1"), 1);
        assert_eq!(map.get("user:1"), Some(&1));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_serializes_as_plain_string() {
        let json = serde_json::to_string(&Key::from("A-B")).unwrap();
        assert_eq!(json, "\"A-B\"");
    }
}

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Errors produced while deriving or parsing an [`ObjectKey`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("object has no name")]
    MissingName,
    #[error("object has an empty namespace (use None for cluster-scoped objects)")]
    EmptyNamespace,
    #[error("unexpected key format: {0:?}")]
    Malformed(String),
}

/// Stable identity of an object: `namespace/name`, or bare `name` for
/// cluster-scoped objects.
///
/// Derived only from namespace and name, so the same logical object maps to
/// the same key across add, update and delete.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    namespace: Option<String>,
    name: String,
}

impl ObjectKey {
    /// Build a key from its parts (`KeyOf`).
    pub fn new(namespace: Option<&str>, name: &str) -> Result<Self, KeyError> {
        if name.is_empty() {
            return Err(KeyError::MissingName);
        }
        if name.contains('/') {
            return Err(KeyError::Malformed(name.to_string()));
        }
        let namespace = match namespace {
            Some("") => return Err(KeyError::EmptyNamespace),
            Some(ns) if ns.contains('/') => return Err(KeyError::Malformed(format!("{}/{}", ns, name))),
            Some(ns) => Some(ns.to_string()),
            None => None,
        };
        Ok(Self { namespace, name: name.to_string() })
    }

    /// Parse the string form produced by `Display` (`SplitKey`).
    pub fn parse(key: &str) -> Result<Self, KeyError> {
        let parts: Vec<&str> = key.split('/').collect();
        match parts.as_slice() {
            [name] => Self::new(None, name),
            [ns, name] if !ns.is_empty() && !name.is_empty() => Self::new(Some(ns), name),
            _ => Err(KeyError::Malformed(key.to_string())),
        }
    }

    pub fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }
    pub fn name(&self) -> &str { &self.name }

    /// Split into `(namespace, name)`.
    pub fn split(&self) -> (Option<&str>, &str) { (self.namespace.as_deref(), &self.name) }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for ObjectKey {
    type Err = KeyError;
    fn from_str(s: &str) -> Result<Self, Self::Err> { Self::parse(s) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaced_key_round_trips_through_display() {
        let k = ObjectKey::new(Some("ns"), "foo").unwrap();
        assert_eq!(k.to_string(), "ns/foo");
        assert_eq!(ObjectKey::parse("ns/foo").unwrap(), k);
        assert_eq!(k.split(), (Some("ns"), "foo"));
    }

    #[test]
    fn cluster_scoped_key_has_no_namespace() {
        let k: ObjectKey = "node-1".parse().unwrap();
        assert_eq!(k.namespace(), None);
        assert_eq!(k.name(), "node-1");
        assert_eq!(k.to_string(), "node-1");
    }

    #[test]
    fn malformed_keys_are_rejected() {
        assert_eq!(ObjectKey::parse(""), Err(KeyError::MissingName));
        assert!(matches!(ObjectKey::parse("a/b/c"), Err(KeyError::Malformed(_))));
        assert!(matches!(ObjectKey::parse("/foo"), Err(KeyError::Malformed(_))));
        assert!(matches!(ObjectKey::parse("ns/"), Err(KeyError::Malformed(_))));
        assert_eq!(ObjectKey::new(Some(""), "foo"), Err(KeyError::EmptyNamespace));
        assert!(matches!(ObjectKey::new(None, "a/b"), Err(KeyError::Malformed(_))));
    }
}

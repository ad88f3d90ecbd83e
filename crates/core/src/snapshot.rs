use serde::{Deserialize, Serialize};

use crate::key::{KeyError, ObjectKey};

pub type Uid = [u8; 16];

/// Last-known version of an object as mirrored by the cache.
///
/// Owned by the cache and shared read-only (`Arc<ObjectSnapshot>`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSnapshot {
    pub namespace: Option<String>,
    pub name: String,
    pub uid: Option<Uid>,
    /// Opaque version token; identical tokens mean identical state.
    pub resource_version: Option<String>,
    /// Raw object body (metadata, spec, status).
    pub raw: serde_json::Value,
}

impl ObjectSnapshot {
    pub fn new(namespace: Option<&str>, name: &str, resource_version: &str, raw: serde_json::Value) -> Self {
        Self {
            namespace: namespace.map(|s| s.to_string()),
            name: name.to_string(),
            uid: None,
            resource_version: Some(resource_version.to_string()),
            raw,
        }
    }

    /// Derive the object's key from namespace and name only.
    pub fn key(&self) -> Result<ObjectKey, KeyError> {
        ObjectKey::new(self.namespace.as_deref(), &self.name)
    }

    /// True when both snapshots carry the same, present, version token.
    pub fn same_version(&self, other: &ObjectSnapshot) -> bool {
        match (&self.resource_version, &other.resource_version) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Look up a value under `spec` by dotted path, e.g. `"cronSpec"`.
    pub fn spec_field(&self, path: &str) -> Option<&serde_json::Value> {
        path.split('.').try_fold(self.raw.get("spec")?, |v, seg| v.get(seg))
    }
}

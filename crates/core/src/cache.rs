use std::sync::Arc;

use crate::key::{KeyError, ObjectKey};
use crate::snapshot::ObjectSnapshot;

/// A delete notification. The watch may miss the final state of an object
/// (e.g. it was deleted while disconnected); the cache then only knows the key.
#[derive(Debug, Clone)]
pub enum DeletedObject {
    Known(Arc<ObjectSnapshot>),
    Tombstone { key: String },
}

impl DeletedObject {
    pub fn key(&self) -> Result<ObjectKey, KeyError> {
        match self {
            DeletedObject::Known(s) => s.key(),
            DeletedObject::Tombstone { key } => ObjectKey::parse(key),
        }
    }
}

/// Receiver of change notifications from a cache.
///
/// Callbacks run on the cache's notification task and must not block.
pub trait ResourceEventHandler: Send + Sync {
    fn on_add(&self, obj: &Arc<ObjectSnapshot>);
    fn on_update(&self, old: &Arc<ObjectSnapshot>, new: &Arc<ObjectSnapshot>);
    fn on_delete(&self, obj: &DeletedObject);
}

/// Point-in-time read access to the mirrored objects.
pub trait CacheReader: Send + Sync {
    fn get(&self, namespace: Option<&str>, name: &str) -> Option<Arc<ObjectSnapshot>>;

    fn get_by_key(&self, key: &ObjectKey) -> Option<Arc<ObjectSnapshot>> {
        let (ns, name) = key.split();
        self.get(ns, name)
    }
}

/// A cache that delivers notifications and reports its initial sync.
pub trait EventSource: CacheReader {
    fn add_event_handler(&self, handler: Arc<dyn ResourceEventHandler>);

    /// True once the initial full list has been applied.
    fn has_synced(&self) -> bool;
}

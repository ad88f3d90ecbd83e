//! Steward store: local mirror of watched objects.
//!
//! The store is written by a single reflector task (list + watch) and read by
//! any number of reconcilers. Every mutation is turned into a notification for
//! the registered [`ResourceEventHandler`]s, after the map has been updated so
//! that handlers observe the new state when they read back.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use arc_swap::ArcSwap;
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use steward_core::{CacheReader, DeletedObject, EventSource, ObjectKey, ObjectSnapshot, ResourceEventHandler};
use tracing::{debug, warn};

type Handlers = Vec<Arc<dyn ResourceEventHandler>>;

/// In-memory mirror keyed by [`ObjectKey`].
pub struct Store {
    items: RwLock<FxHashMap<ObjectKey, Arc<ObjectSnapshot>>>,
    handlers: ArcSwap<Handlers>,
    synced: AtomicBool,
}

impl Default for Store {
    fn default() -> Self { Self::new() }
}

impl Store {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(FxHashMap::default()),
            handlers: ArcSwap::from_pointee(Vec::new()),
            synced: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize { self.read().len() }
    pub fn is_empty(&self) -> bool { self.read().is_empty() }

    pub fn keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> = self.read().keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    pub fn list(&self) -> Vec<Arc<ObjectSnapshot>> { self.read().values().cloned().collect() }

    /// Insert or replace an object; notifies `on_add` or `on_update`.
    pub fn apply(&self, obj: ObjectSnapshot) {
        let key = match obj.key() {
            Ok(k) => k,
            Err(e) => {
                warn!(error = %e, name = %obj.name, "dropping object without a valid key");
                return;
            }
        };
        let new = Arc::new(obj);
        let old = self.write().insert(key, Arc::clone(&new));
        self.record_len();
        match old {
            Some(old) => self.notify(|h| h.on_update(&old, &new)),
            None => self.notify(|h| h.on_add(&new)),
        }
    }

    /// Remove an object; notifies `on_delete` with the final state we hold
    /// (or the given state when we never saw the object).
    pub fn delete(&self, obj: ObjectSnapshot) {
        let key = match obj.key() {
            Ok(k) => k,
            Err(e) => {
                warn!(error = %e, name = %obj.name, "dropping delete without a valid key");
                return;
            }
        };
        let last = self.write().remove(&key).unwrap_or_else(|| Arc::new(obj));
        self.record_len();
        let deleted = DeletedObject::Known(last);
        self.notify(|h| h.on_delete(&deleted));
    }

    /// Replace the whole content with a fresh list (initial list or relist
    /// after a watch desync) and mark the store synced.
    ///
    /// Objects missing from the list are reported as tombstones since their
    /// final state was never observed.
    pub fn replace(&self, list: Vec<ObjectSnapshot>) {
        let mut fresh: FxHashMap<ObjectKey, Arc<ObjectSnapshot>> = FxHashMap::default();
        for obj in list {
            match obj.key() {
                Ok(k) => { fresh.insert(k, Arc::new(obj)); }
                Err(e) => warn!(error = %e, name = %obj.name, "dropping listed object without a valid key"),
            }
        }
        let previous = std::mem::replace(&mut *self.write(), fresh.clone());
        self.record_len();
        debug!(count = fresh.len(), previous = previous.len(), "store replaced");

        let mut keys: Vec<&ObjectKey> = fresh.keys().collect();
        keys.sort_unstable();
        for key in keys {
            let Some(new) = fresh.get(key) else { continue };
            match previous.get(key) {
                Some(old) => self.notify(|h| h.on_update(old, new)),
                None => self.notify(|h| h.on_add(new)),
            }
        }
        let mut gone: Vec<&ObjectKey> = previous.keys().filter(|k| !fresh.contains_key(*k)).collect();
        gone.sort_unstable();
        for key in gone {
            let deleted = DeletedObject::Tombstone { key: key.to_string() };
            self.notify(|h| h.on_delete(&deleted));
        }
        self.synced.store(true, Ordering::Release);
    }

    /// Replay every object as an update with identical old and new state.
    pub fn resync(&self) {
        let items = self.list();
        counter!("steward_store_resyncs_total", 1u64);
        debug!(count = items.len(), "store resync");
        for obj in items {
            self.notify(|h| h.on_update(&obj, &obj));
        }
    }

    fn notify(&self, f: impl Fn(&dyn ResourceEventHandler)) {
        for h in self.handlers.load().iter() {
            f(h.as_ref());
        }
    }

    fn record_len(&self) {
        gauge!("steward_store_objects", self.read().len() as f64);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, FxHashMap<ObjectKey, Arc<ObjectSnapshot>>> {
        self.items.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, FxHashMap<ObjectKey, Arc<ObjectSnapshot>>> {
        self.items.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CacheReader for Store {
    fn get(&self, namespace: Option<&str>, name: &str) -> Option<Arc<ObjectSnapshot>> {
        let key = ObjectKey::new(namespace, name).ok()?;
        self.read().get(&key).cloned()
    }
}

impl EventSource for Store {
    fn add_event_handler(&self, handler: Arc<dyn ResourceEventHandler>) {
        self.handlers.rcu(|current| {
            let mut next: Handlers = current.iter().cloned().collect();
            next.push(Arc::clone(&handler));
            next
        });
        // Late registrations see the current content as adds.
        for obj in self.list() {
            handler.on_add(&obj);
        }
    }

    fn has_synced(&self) -> bool { self.synced.load(Ordering::Acquire) }
}

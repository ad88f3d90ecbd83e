use std::sync::Arc;

use metrics::counter;
use steward_core::{DeletedObject, KeyError, ObjectKey, ObjectSnapshot, ResourceEventHandler};
use steward_queue::WorkQueue;
use tracing::{debug, warn};

/// Turns cache notifications into queue keys.
///
/// Adds, changed updates and deletes all enqueue the object's key; the
/// reconciler finds out what happened by reading the cache. Updates carrying
/// the same version on both sides (resync replays) are dropped.
pub struct EventTranslator {
    queue: Arc<WorkQueue>,
}

impl EventTranslator {
    pub fn new(queue: Arc<WorkQueue>) -> Self { Self { queue } }

    fn enqueue(&self, kind: &'static str, key: Result<ObjectKey, KeyError>) {
        match key {
            Ok(key) => {
                debug!(kind, key = %key, "enqueue");
                counter!("steward_events_total", 1u64, "kind" => kind, "result" => "queued");
                self.queue.add(key);
            }
            Err(e) => {
                // Retrying cannot fix a malformed object; drop it.
                warn!(kind, error = %e, "cannot derive key; dropping notification");
                counter!("steward_events_total", 1u64, "kind" => kind, "result" => "dropped");
            }
        }
    }
}

impl ResourceEventHandler for EventTranslator {
    fn on_add(&self, obj: &Arc<ObjectSnapshot>) {
        self.enqueue("add", obj.key());
    }

    fn on_update(&self, old: &Arc<ObjectSnapshot>, new: &Arc<ObjectSnapshot>) {
        if old.same_version(new) {
            counter!("steward_events_total", 1u64, "kind" => "update", "result" => "unchanged");
            return;
        }
        self.enqueue("update", new.key());
    }

    fn on_delete(&self, obj: &DeletedObject) {
        self.enqueue("delete", obj.key());
    }
}

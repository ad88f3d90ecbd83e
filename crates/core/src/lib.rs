//! Steward core types: object keys, snapshots and the seams between the
//! cache, the event handlers and the controller.

#![forbid(unsafe_code)]

mod cache;
mod key;
mod snapshot;

pub use cache::{CacheReader, DeletedObject, EventSource, ResourceEventHandler};
pub use key::{KeyError, ObjectKey};
pub use snapshot::{ObjectSnapshot, Uid};

pub mod prelude {
    pub use super::{
        CacheReader, DeletedObject, EventSource, KeyError, ObjectKey, ObjectSnapshot, ResourceEventHandler, Uid,
    };
}

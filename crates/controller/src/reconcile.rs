use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use metrics::counter;
use rustc_hash::FxHashMap;
use steward_core::{CacheReader, KeyError, ObjectKey};
use tracing::{debug, info, warn};

/// What a successful reconcile asks of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Converged; wait for the next change notification.
    Done,
    /// Not ready yet; look again after the given delay.
    RequeueAfter(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("invalid key: {0}")]
    InvalidKey(#[from] KeyError),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not ready: {0}")]
    NotReady(String),
    #[error(transparent)]
    Authority(#[from] anyhow::Error),
}

impl ReconcileError {
    /// Permanent errors are not retried.
    pub fn is_permanent(&self) -> bool { matches!(self, ReconcileError::InvalidKey(_)) }
}

/// Outcome of one reconcile as reported back to the queue.
#[derive(Debug)]
pub enum ReconcileOutcome {
    /// Forget the key's backoff history.
    Success,
    /// Retry with exponential backoff.
    Requeue(ReconcileError),
    /// Retry after an explicit delay; not a failure.
    RequeueAfter(Duration),
}

impl From<Result<Action, ReconcileError>> for ReconcileOutcome {
    fn from(res: Result<Action, ReconcileError>) -> Self {
        match res {
            Ok(Action::Done) => ReconcileOutcome::Success,
            Ok(Action::RequeueAfter(d)) => ReconcileOutcome::RequeueAfter(d),
            Err(e) => ReconcileOutcome::Requeue(e),
        }
    }
}

/// Drives the object named by `key` toward its desired state.
///
/// Implementations read the current state from `cache` and must be
/// idempotent: keys are delivered at least once, and replays of an unchanged
/// object must not repeat side effects. An object missing from the cache has
/// been deleted and is a successful terminal state.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync + 'static {
    async fn reconcile(&self, key: &ObjectKey, cache: &dyn CacheReader) -> Result<Action, ReconcileError>;
}

/// Placeholder reconciler for the `CronTab` resource: logs the spec of each
/// new version it sees.
#[derive(Default)]
pub struct CronTabReconciler {
    observed: Mutex<FxHashMap<ObjectKey, String>>,
    processed: AtomicU64,
}

impl CronTabReconciler {
    pub fn new() -> Self { Self::default() }

    /// Version of `key` last acted upon.
    pub fn observed_version(&self, key: &ObjectKey) -> Option<String> {
        self.observed.lock().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    /// Number of versions acted upon so far.
    pub fn processed(&self) -> u64 { self.processed.load(Ordering::Relaxed) }
}

#[async_trait::async_trait]
impl Reconciler for CronTabReconciler {
    async fn reconcile(&self, key: &ObjectKey, cache: &dyn CacheReader) -> Result<Action, ReconcileError> {
        let (namespace, name) = key.split();
        let Some(crontab) = cache.get(namespace, name) else {
            warn!(key = %key, "crontab deleting");
            self.observed.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
            return Ok(Action::Done);
        };

        let version = crontab.resource_version.clone().unwrap_or_default();
        let mut observed = self.observed.lock().unwrap_or_else(PoisonError::into_inner);
        if observed.get(key) == Some(&version) {
            debug!(key = %key, resource_version = %version, "crontab already processed");
            return Ok(Action::Done);
        }

        let cron_spec = crontab.spec_field("cronSpec").and_then(|v| v.as_str());
        let image = crontab.spec_field("image").and_then(|v| v.as_str());
        let replicas = crontab.spec_field("replicas").and_then(|v| v.as_i64());
        info!(key = %key, resource_version = %version, cron_spec = ?cron_spec, image = ?image, replicas = ?replicas, "crontab try to process");

        observed.insert(key.clone(), version);
        self.processed.fetch_add(1, Ordering::Relaxed);
        counter!("steward_crontab_processed_total", 1u64);
        Ok(Action::Done)
    }
}

use std::sync::Arc;

use steward_core::{CacheReader, EventSource};
use steward_queue::WorkQueue;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::ControllerConfig;
use crate::reconcile::Reconciler;
use crate::translator::EventTranslator;
use crate::worker::{supervise, Worker};

/// Lifecycle of a [`Controller`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Created,
    CacheSyncing,
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("timed out waiting for caches to sync")]
    CacheSyncTimedOut,
}

/// Wires a cache, a work queue and a reconciler together.
pub struct Controller {
    config: ControllerConfig,
    queue: Arc<WorkQueue>,
    source: Arc<dyn EventSource>,
    reader: Arc<dyn CacheReader>,
    reconciler: Arc<dyn Reconciler>,
    phase: watch::Sender<Phase>,
}

impl Controller {
    /// Create the queue and register the event translator with `cache`.
    /// No key is processed before [`run`](Self::run).
    pub fn new<C, R>(cache: Arc<C>, reconciler: Arc<R>, config: ControllerConfig) -> Self
    where
        C: EventSource + 'static,
        R: Reconciler,
    {
        info!(name = %config.name, workers = config.workers, "setting up controller");
        let queue = Arc::new(WorkQueue::new(config.name.clone(), config.rate_limiter()));
        cache.add_event_handler(Arc::new(EventTranslator::new(Arc::clone(&queue))));
        let reader: Arc<dyn CacheReader> = cache.clone();
        let (phase, _) = watch::channel(Phase::Created);
        Self { config, queue, source: cache, reader, reconciler, phase }
    }

    pub fn queue(&self) -> Arc<WorkQueue> { Arc::clone(&self.queue) }

    pub fn phase(&self) -> Phase { *self.phase.borrow() }

    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> { self.phase.subscribe() }

    /// Wait for the cache to sync, run the workers until `cancel` fires, then
    /// shut the queue down and wait for in-flight reconciles.
    ///
    /// Fails with [`ControllerError::CacheSyncTimedOut`] when cancellation (or
    /// the configured sync timeout) comes before the sync; no worker is
    /// started in that case.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ControllerError> {
        info!(name = %self.config.name, "starting controller");
        self.set_phase(Phase::CacheSyncing);
        if let Err(e) = self.wait_for_cache_sync(&cancel).await {
            error!(name = %self.config.name, error = %e, "cache sync failed");
            self.queue.shut_down();
            self.set_phase(Phase::Stopped);
            return Err(e);
        }
        info!(name = %self.config.name, "caches synced");

        self.set_phase(Phase::Running);
        let worker = Arc::new(Worker {
            queue: Arc::clone(&self.queue),
            cache: Arc::clone(&self.reader),
            reconciler: Arc::clone(&self.reconciler),
            max_retries: self.config.max_retries,
        });
        let mut workers = JoinSet::new();
        for id in 0..self.config.workers.max(1) {
            workers.spawn(supervise(id, Arc::clone(&worker), cancel.clone(), self.config.worker_restart_period));
        }

        cancel.cancelled().await;
        info!(name = %self.config.name, "stopping controller");
        self.set_phase(Phase::ShuttingDown);
        self.queue.shut_down();
        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "worker supervisor failed");
            }
        }
        self.set_phase(Phase::Stopped);
        info!(name = %self.config.name, "controller stopped");
        Ok(())
    }

    async fn wait_for_cache_sync(&self, cancel: &CancellationToken) -> Result<(), ControllerError> {
        let deadline = self.config.cache_sync_timeout.map(|t| Instant::now() + t);
        loop {
            if self.source.has_synced() {
                return Ok(());
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(ControllerError::CacheSyncTimedOut);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ControllerError::CacheSyncTimedOut),
                _ = tokio::time::sleep(self.config.sync_poll_interval) => {}
            }
        }
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.send_replace(phase);
    }
}

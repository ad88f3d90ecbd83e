use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use metrics::{counter, histogram};
use steward_core::{CacheReader, ObjectKey};
use steward_queue::WorkQueue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::reconcile::{ReconcileOutcome, Reconciler};

/// Marks the key done on drop, so the queue releases it even when the
/// worker unwinds.
struct InFlight<'a> {
    queue: &'a WorkQueue,
    key: &'a ObjectKey,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) { self.queue.done(self.key) }
}

pub(crate) struct Worker {
    pub(crate) queue: Arc<WorkQueue>,
    pub(crate) cache: Arc<dyn CacheReader>,
    pub(crate) reconciler: Arc<dyn Reconciler>,
    pub(crate) max_retries: Option<u32>,
}

impl Worker {
    /// Process keys until the queue is shut down and drained.
    pub(crate) async fn run(&self, id: usize) {
        debug!(worker = id, "worker started");
        while let Some(key) = self.queue.get().await {
            self.process(key).await;
        }
        debug!(worker = id, "worker stopped");
    }

    pub(crate) async fn process(&self, key: ObjectKey) {
        let _in_flight = InFlight { queue: &self.queue, key: &key };
        let started = Instant::now();
        let res = AssertUnwindSafe(self.reconciler.reconcile(&key, self.cache.as_ref()))
            .catch_unwind()
            .await;
        histogram!("steward_reconcile_duration_seconds", started.elapsed().as_secs_f64());
        match res {
            Ok(res) => self.report(&key, ReconcileOutcome::from(res)),
            Err(panic) => {
                // Retrying is unlikely to help and would spin on the same fault.
                error!(key = %key, panic = %panic_message(panic.as_ref()), "reconcile panicked; dropping key");
                counter!("steward_reconcile_total", 1u64, "result" => "panic");
                self.queue.forget(&key);
            }
        }
    }

    fn report(&self, key: &ObjectKey, outcome: ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Success => {
                counter!("steward_reconcile_total", 1u64, "result" => "success");
                self.queue.forget(key);
                info!(key = %key, "successfully synced");
            }
            ReconcileOutcome::RequeueAfter(delay) => {
                counter!("steward_reconcile_total", 1u64, "result" => "requeue_after");
                self.queue.forget(key);
                debug!(key = %key, delay_ms = delay.as_millis() as u64, "requeue after delay");
                self.queue.add_after(key.clone(), delay);
            }
            ReconcileOutcome::Requeue(err) if err.is_permanent() => {
                counter!("steward_reconcile_total", 1u64, "result" => "dropped");
                error!(key = %key, error = %err, "sync failed permanently; dropping key");
                self.queue.forget(key);
            }
            ReconcileOutcome::Requeue(err) => {
                let retries = self.queue.num_requeues(key);
                match self.max_retries {
                    Some(max) if retries >= max => {
                        counter!("steward_reconcile_total", 1u64, "result" => "dropped");
                        error!(key = %key, error = %err, retries, "sync error; retries exhausted, dropping key");
                        self.queue.forget(key);
                    }
                    _ => {
                        counter!("steward_reconcile_total", 1u64, "result" => "error");
                        warn!(key = %key, error = %err, retries, "sync error; requeueing");
                        self.queue.add_rate_limited(key.clone());
                    }
                }
            }
        }
    }
}

/// Keep a worker running until it returns on queue shutdown; a crashed
/// worker is restarted after `period` unless `cancel` fired meanwhile.
pub(crate) async fn supervise(id: usize, worker: Arc<Worker>, cancel: CancellationToken, period: Duration) {
    loop {
        let w = Arc::clone(&worker);
        match tokio::spawn(async move { w.run(id).await }).await {
            Ok(()) => return,
            Err(e) if e.is_panic() => {
                counter!("steward_worker_restarts_total", 1u64);
                error!(worker = id, "worker crashed; restarting");
            }
            Err(e) => {
                warn!(worker = id, error = %e, "worker task cancelled");
                return;
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(period) => {}
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use steward_queue::RateLimiter;
    use steward_store::Store;

    use super::*;
    use crate::reconcile::{Action, ReconcileError};

    /// Limiter that panics on its first call, outside the reconcile boundary.
    #[derive(Default)]
    struct FaultyLimiter {
        tripped: AtomicBool,
    }

    impl RateLimiter for FaultyLimiter {
        fn when(&self, _key: &ObjectKey) -> Duration {
            if !self.tripped.swap(true, Ordering::SeqCst) {
                panic!("limiter fault");
            }
            Duration::from_millis(1)
        }
        fn forget(&self, _key: &ObjectKey) {}
        fn num_requeues(&self, _key: &ObjectKey) -> u32 { 0 }
    }

    /// Fails `bad` once, succeeds for everything else.
    #[derive(Default)]
    struct FailOnce {
        failed: AtomicBool,
        succeeded: AtomicU32,
    }

    #[async_trait::async_trait]
    impl Reconciler for FailOnce {
        async fn reconcile(&self, key: &ObjectKey, _cache: &dyn CacheReader) -> Result<Action, ReconcileError> {
            if key.name() == "bad" && !self.failed.swap(true, Ordering::SeqCst) {
                return Err(ReconcileError::NotReady("not yet".into()));
            }
            self.succeeded.fetch_add(1, Ordering::SeqCst);
            Ok(Action::Done)
        }
    }

    fn key(name: &str) -> ObjectKey { ObjectKey::new(Some("ns"), name).unwrap() }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn crashed_worker_is_restarted_and_keeps_processing() {
        let queue = Arc::new(WorkQueue::new("test", FaultyLimiter::default()));
        let reconciler = Arc::new(FailOnce::default());
        let worker = Arc::new(Worker {
            queue: Arc::clone(&queue),
            cache: Arc::new(Store::new()),
            reconciler: reconciler.clone(),
            max_retries: None,
        });
        let cancel = CancellationToken::new();
        let supervisor = tokio::spawn(supervise(0, worker, cancel.clone(), Duration::from_millis(10)));

        // The transient failure reaches the limiter, which takes the worker down.
        queue.add(key("bad"));
        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.in_flight() > 0 || queue.len() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(queue.in_flight(), 0);

        queue.add(key("good"));
        tokio::time::timeout(Duration::from_secs(5), async {
            while reconciler.succeeded.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("restarted worker picks up new keys");
        assert!(!supervisor.is_finished());

        queue.shut_down();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), supervisor).await.unwrap().unwrap();
        assert_eq!(queue.in_flight(), 0);
    }

    #[test]
    fn panic_payloads_are_rendered() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}

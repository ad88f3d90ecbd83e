use std::time::Duration;

use steward_queue::{BucketRateLimiter, ItemExponentialFailureRateLimiter, MaxOfRateLimiter};

/// Tunables of a [`Controller`](crate::Controller).
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Queue name, used in logs and metric labels.
    pub name: String,
    /// Concurrent workers (at least one is started).
    pub workers: usize,
    /// Per-key backoff: `backoff_base * 2^failures`, capped at `backoff_max`.
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Overall retry budget shared by all keys.
    pub qps: f64,
    pub burst: u32,
    /// Drop a key after this many consecutive failures. `None` retries forever.
    pub max_retries: Option<u32>,
    /// Give up waiting for the initial cache sync after this long.
    pub cache_sync_timeout: Option<Duration>,
    pub sync_poll_interval: Duration,
    /// Pause before restarting a crashed worker.
    pub worker_restart_period: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: "crontab-controller".to_string(),
            workers: 1,
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(1000),
            qps: 10.0,
            burst: 100,
            max_retries: None,
            cache_sync_timeout: None,
            sync_poll_interval: Duration::from_millis(100),
            worker_restart_period: Duration::from_secs(1),
        }
    }
}

impl ControllerConfig {
    pub fn rate_limiter(&self) -> MaxOfRateLimiter {
        MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialFailureRateLimiter::new(self.backoff_base, self.backoff_max)),
            Box::new(BucketRateLimiter::new(self.qps, self.burst)),
        ])
    }
}

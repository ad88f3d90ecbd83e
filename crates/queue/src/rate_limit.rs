//! Per-key and overall rate limiters deciding how long a requeue waits.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashMap;
use steward_core::ObjectKey;
use tokio::time::Instant;

/// Decides the delay before a key may be retried.
pub trait RateLimiter: Send + Sync {
    /// Delay for the next retry of `key`; records one more failure.
    fn when(&self, key: &ObjectKey) -> Duration;
    /// Clear the failure history of `key`.
    fn forget(&self, key: &ObjectKey);
    /// Failures recorded for `key` since the last `forget`.
    fn num_requeues(&self, key: &ObjectKey) -> u32;
}

/// `base * 2^failures`, capped at `max`.
pub struct ItemExponentialFailureRateLimiter {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<ObjectKey, u32>>,
}

impl ItemExponentialFailureRateLimiter {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, failures: Mutex::new(FxHashMap::default()) }
    }
}

impl RateLimiter for ItemExponentialFailureRateLimiter {
    fn when(&self, key: &ObjectKey) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let n = failures.entry(key.clone()).or_insert(0);
        let exp = *n;
        *n = n.saturating_add(1);
        2u32.checked_pow(exp)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |d| d.min(self.max))
    }

    fn forget(&self, key: &ObjectKey) {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
    }

    fn num_requeues(&self, key: &ObjectKey) -> u32 {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).get(key).copied().unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Overall token bucket shared by all keys: `qps` refill rate, `burst` capacity.
/// A non-positive or non-finite `qps` disables the limit.
pub struct BucketRateLimiter {
    qps: Option<f64>,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps: (qps.is_finite() && qps > 0.0).then_some(qps),
            burst,
            bucket: Mutex::new(Bucket { tokens: burst, last: Instant::now() }),
        }
    }
}

impl RateLimiter for BucketRateLimiter {
    fn when(&self, _key: &ObjectKey) -> Duration {
        let Some(qps) = self.qps else { return Duration::ZERO };
        let mut b = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(b.last).as_secs_f64();
        b.tokens = (b.tokens + elapsed * qps).min(self.burst);
        b.last = now;
        // Reserve a token; a negative balance is the wait for it to refill.
        b.tokens -= 1.0;
        if b.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-b.tokens / qps).unwrap_or(Duration::MAX)
        }
    }

    fn forget(&self, _key: &ObjectKey) {}

    fn num_requeues(&self, _key: &ObjectKey) -> u32 { 0 }
}

/// Worst case of several limiters.
pub struct MaxOfRateLimiter {
    limiters: Vec<Box<dyn RateLimiter>>,
}

impl MaxOfRateLimiter {
    pub fn new(limiters: Vec<Box<dyn RateLimiter>>) -> Self { Self { limiters } }
}

impl RateLimiter for MaxOfRateLimiter {
    fn when(&self, key: &ObjectKey) -> Duration {
        // Every limiter must observe the failure, so no short-circuit here.
        self.limiters.iter().map(|l| l.when(key)).fold(Duration::ZERO, Duration::max)
    }

    fn forget(&self, key: &ObjectKey) {
        for l in &self.limiters {
            l.forget(key);
        }
    }

    fn num_requeues(&self, key: &ObjectKey) -> u32 {
        self.limiters.iter().map(|l| l.num_requeues(key)).max().unwrap_or(0)
    }
}

/// Per-key exponential backoff (5ms .. 1000s) combined with an overall
/// 10 qps / 100 burst bucket.
pub fn default_controller_rate_limiter() -> MaxOfRateLimiter {
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1000))),
        Box::new(BucketRateLimiter::new(10.0, 100)),
    ])
}

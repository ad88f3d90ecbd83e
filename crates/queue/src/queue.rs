use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use steward_core::ObjectKey;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::rate_limit::{default_controller_rate_limiter, RateLimiter};

/// Longest delay honoured by `add_after`; longer ones are clamped so the
/// deadline stays representable.
const MAX_DELAY: Duration = Duration::from_secs(86_400 * 365 * 30);

#[derive(Default)]
struct State {
    /// Ready keys in FIFO order; each appears at most once.
    queue: VecDeque<ObjectKey>,
    /// Keys that need processing: queued, or re-added while in flight.
    dirty: FxHashSet<ObjectKey>,
    /// Keys handed out by `get` and not yet `done`.
    processing: FxHashSet<ObjectKey>,
    /// Delayed keys ordered by deadline. Entries whose deadline no longer
    /// matches `waiting_deadline` are stale and skipped.
    waiting: BinaryHeap<Reverse<(Instant, ObjectKey)>>,
    waiting_deadline: FxHashMap<ObjectKey, Instant>,
    added_at: FxHashMap<ObjectKey, Instant>,
    started_at: FxHashMap<ObjectKey, Instant>,
    shutting_down: bool,
}

impl State {
    /// Returns true when the key became visible to consumers.
    fn insert(&mut self, key: ObjectKey, now: Instant) -> bool {
        if self.dirty.contains(&key) {
            return false;
        }
        self.dirty.insert(key.clone());
        self.added_at.entry(key.clone()).or_insert(now);
        if self.processing.contains(&key) {
            return false;
        }
        self.queue.push_back(key);
        true
    }

    fn promote_due(&mut self, now: Instant) -> usize {
        let mut promoted = 0;
        while let Some(Reverse((deadline, _))) = self.waiting.peek() {
            if *deadline > now {
                break;
            }
            let Some(Reverse((deadline, key))) = self.waiting.pop() else { break };
            if self.waiting_deadline.get(&key) != Some(&deadline) {
                continue;
            }
            self.waiting_deadline.remove(&key);
            if self.insert(key, now) {
                promoted += 1;
            }
        }
        promoted
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.waiting.peek().map(|Reverse((deadline, _))| *deadline)
    }
}

/// Deduplicating, rate-limited FIFO of [`ObjectKey`]s.
///
/// * a key is pending at most once, however often it is added;
/// * a key handed out by [`get`](Self::get) is not handed out again until
///   [`done`](Self::done); adds in between mark it dirty and it is queued
///   again at `done`;
/// * after [`shut_down`](Self::shut_down) adds are ignored, ready keys still
///   drain, then `get` returns `None`.
pub struct WorkQueue {
    name: String,
    state: Mutex<State>,
    ready: Notify,
    drained: Notify,
    limiter: Box<dyn RateLimiter>,
}

impl WorkQueue {
    pub fn new(name: impl Into<String>, limiter: impl RateLimiter + 'static) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State::default()),
            ready: Notify::new(),
            drained: Notify::new(),
            limiter: Box::new(limiter),
        }
    }

    /// Queue using [`default_controller_rate_limiter`].
    pub fn with_default_rate_limiter(name: impl Into<String>) -> Self {
        Self::new(name, default_controller_rate_limiter())
    }

    pub fn name(&self) -> &str { &self.name }

    /// Make `key` pending unless it already is.
    pub fn add(&self, key: ObjectKey) {
        let mut st = self.lock();
        if st.shutting_down {
            debug!(queue = %self.name, key = %key, "queue shutting down; add ignored");
            return;
        }
        counter!("steward_workqueue_adds_total", 1u64, "name" => self.name.clone());
        if st.insert(key, Instant::now()) {
            self.record_depth(&st);
            self.ready.notify_one();
        }
    }

    /// Make `key` pending once `delay` has elapsed. A key already waiting
    /// keeps the earlier of the two deadlines.
    pub fn add_after(&self, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            return self.add(key);
        }
        let mut st = self.lock();
        if st.shutting_down {
            return;
        }
        let now = Instant::now();
        let deadline = now.checked_add(delay.min(MAX_DELAY)).unwrap_or(now);
        if matches!(st.waiting_deadline.get(&key), Some(existing) if *existing <= deadline) {
            return;
        }
        st.waiting_deadline.insert(key.clone(), deadline);
        st.waiting.push(Reverse((deadline, key)));
        // A sleeping consumer may need to shorten its timer.
        self.ready.notify_one();
    }

    /// Requeue `key` after the delay chosen by the rate limiter.
    pub fn add_rate_limited(&self, key: ObjectKey) {
        if self.is_shutting_down() {
            debug!(queue = %self.name, key = %key, "queue shutting down; retry ignored");
            return;
        }
        let delay = self.limiter.when(&key);
        counter!("steward_workqueue_retries_total", 1u64, "name" => self.name.clone());
        debug!(queue = %self.name, key = %key, delay_ms = delay.as_millis() as u64, "rate limited requeue");
        self.add_after(key, delay);
    }

    /// Clear the rate limiter's failure history for `key`.
    pub fn forget(&self, key: &ObjectKey) { self.limiter.forget(key) }

    pub fn num_requeues(&self, key: &ObjectKey) -> u32 { self.limiter.num_requeues(key) }

    /// Wait for the next ready key. `None` means the queue is shut down and
    /// drained; the caller should stop.
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            // Register before inspecting state so no wakeup is missed.
            notified.as_mut().enable();

            let deadline = {
                let mut st = self.lock();
                let now = Instant::now();
                st.promote_due(now);
                if let Some(key) = st.queue.pop_front() {
                    st.dirty.remove(&key);
                    st.processing.insert(key.clone());
                    if let Some(added) = st.added_at.remove(&key) {
                        histogram!("steward_workqueue_queue_duration_seconds", now.duration_since(added).as_secs_f64(), "name" => self.name.clone());
                    }
                    st.started_at.insert(key.clone(), now);
                    self.record_depth(&st);
                    if !st.queue.is_empty() || !st.waiting.is_empty() {
                        self.ready.notify_one();
                    }
                    return Some(key);
                }
                if st.shutting_down {
                    return None;
                }
                st.next_deadline()
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Mark `key` as no longer in flight. A key re-added meanwhile becomes
    /// pending again.
    pub fn done(&self, key: &ObjectKey) {
        let mut st = self.lock();
        st.processing.remove(key);
        if let Some(started) = st.started_at.remove(key) {
            histogram!("steward_workqueue_work_duration_seconds", started.elapsed().as_secs_f64(), "name" => self.name.clone());
        }
        if st.dirty.contains(key) {
            st.queue.push_back(key.clone());
            self.record_depth(&st);
            self.ready.notify_one();
        }
        if st.shutting_down && st.processing.is_empty() {
            self.drained.notify_waiters();
        }
    }

    /// Stop accepting keys and release blocked consumers once ready keys are
    /// drained. Delayed keys are discarded. Idempotent.
    pub fn shut_down(&self) {
        let mut st = self.lock();
        if !st.shutting_down {
            debug!(queue = %self.name, pending = st.queue.len(), in_flight = st.processing.len(), "shutting down queue");
        }
        st.shutting_down = true;
        st.waiting.clear();
        st.waiting_deadline.clear();
        self.ready.notify_waiters();
        if st.processing.is_empty() {
            self.drained.notify_waiters();
        }
    }

    /// [`shut_down`](Self::shut_down), then wait until no key is in flight.
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.lock().processing.is_empty() {
                return;
            }
            notified.await;
        }
    }

    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }

    /// Number of keys ready to be handed out.
    pub fn len(&self) -> usize {
        let mut st = self.lock();
        st.promote_due(Instant::now());
        st.queue.len()
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Number of keys currently in flight.
    pub fn in_flight(&self) -> usize { self.lock().processing.len() }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_depth(&self, st: &State) {
        gauge!("steward_workqueue_depth", st.queue.len() as f64, "name" => self.name.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::ItemExponentialFailureRateLimiter;
    use std::sync::Arc;

    fn key(name: &str) -> ObjectKey { ObjectKey::new(Some("ns"), name).unwrap() }

    fn queue() -> WorkQueue {
        WorkQueue::new("test", ItemExponentialFailureRateLimiter::new(Duration::from_millis(10), Duration::from_secs(1)))
    }

    #[tokio::test]
    async fn repeated_adds_coalesce_into_one_pending_entry() {
        let q = queue();
        for _ in 0..5 {
            q.add(key("a"));
        }
        q.add(key("b"));
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some(key("a")));
        assert_eq!(q.get().await, Some(key("b")));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn add_while_in_flight_requeues_at_done() {
        let q = queue();
        q.add(key("a"));
        let k = q.get().await.unwrap();
        q.add(key("a"));
        q.add(key("a"));
        // In flight: not handed out a second time yet.
        assert_eq!(q.len(), 0);
        assert_eq!(q.in_flight(), 1);
        q.done(&k);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some(key("a")));
        q.done(&k);
        assert!(q.is_empty());
        assert_eq!(q.in_flight(), 0);
    }

    #[tokio::test]
    async fn shut_down_releases_blocked_consumers() {
        let q = Arc::new(queue());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let q = q.clone();
                tokio::spawn(async move { q.get().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.shut_down();
        q.shut_down();
        for w in waiters {
            let got = tokio::time::timeout(Duration::from_secs(1), w).await.expect("get did not return").unwrap();
            assert_eq!(got, None);
        }
    }

    #[tokio::test]
    async fn shut_down_drains_ready_keys_and_ignores_new_ones() {
        let q = queue();
        q.add(key("a"));
        q.add(key("b"));
        q.add_after(key("c"), Duration::from_secs(60));
        q.shut_down();
        q.add(key("d"));
        assert_eq!(q.get().await, Some(key("a")));
        assert_eq!(q.get().await, Some(key("b")));
        assert_eq!(q.get().await, None);
        assert!(q.is_shutting_down());
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_becomes_visible_once_the_delay_elapses() {
        let q = queue();
        let start = Instant::now();
        q.add_after(key("a"), Duration::from_secs(2));
        assert_eq!(q.len(), 0);
        assert_eq!(q.get().await, Some(key("a")));
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_keeps_the_earliest_deadline() {
        let q = queue();
        let start = Instant::now();
        q.add_after(key("a"), Duration::from_secs(1));
        q.add_after(key("a"), Duration::from_secs(10));
        assert_eq!(q.get().await, Some(key("a")));
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(1) && waited < Duration::from_secs(10), "waited {:?}", waited);
        q.done(&key("a"));
        // The later request must not resurrect the key.
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_key_wakes_an_already_blocked_consumer() {
        let q = Arc::new(queue());
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        q.add_after(key("late"), Duration::from_millis(500));
        assert_eq!(consumer.await.unwrap(), Some(key("late")));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_adds_back_off_until_forgotten() {
        let q = queue();
        let k = key("a");
        let start = Instant::now();
        q.add_rate_limited(k.clone());
        assert_eq!(q.get().await, Some(k.clone()));
        q.done(&k);
        q.add_rate_limited(k.clone());
        assert_eq!(q.get().await, Some(k.clone()));
        q.done(&k);
        // 10ms + 20ms
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(q.num_requeues(&k), 2);
        q.forget(&k);
        assert_eq!(q.num_requeues(&k), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn huge_delays_are_clamped_instead_of_overflowing() {
        let q = queue();
        q.add_after(key("a"), Duration::MAX);
        q.add_after(key("b"), Duration::from_secs(u64::MAX));
        assert!(q.is_empty());
        // An earlier request still wins over the clamped deadline.
        q.add_after(key("a"), Duration::from_millis(10));
        assert_eq!(q.get().await, Some(key("a")));
        tokio::time::advance(Duration::from_secs(86_400)).await;
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn retries_after_shut_down_do_not_grow_backoff() {
        let q = queue();
        q.shut_down();
        q.add_rate_limited(key("a"));
        q.add_rate_limited(key("a"));
        assert_eq!(q.num_requeues(&key("a")), 0);
        assert_eq!(q.get().await, None);
    }

    #[tokio::test]
    async fn shut_down_with_drain_waits_for_in_flight_keys() {
        let q = Arc::new(queue());
        q.add(key("a"));
        let k = q.get().await.unwrap();
        let drain = {
            let q = q.clone();
            tokio::spawn(async move { q.shut_down_with_drain().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!drain.is_finished());
        q.done(&k);
        tokio::time::timeout(Duration::from_secs(1), drain).await.expect("drain did not finish").unwrap();
    }
}

//! Retry delay policies for [`crate::WorkQueue::add_rate_limited`].

use std::hash::Hash;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

pub trait RateLimiter<K>: Send + Sync {
    /// Delay before `item` may be processed again; records one more requeue.
    fn when(&self, item: &K) -> Duration;
    /// Stop tracking `item` (after success or after giving up).
    fn forget(&self, item: &K);
    fn num_requeues(&self, item: &K) -> u32;
}

/// `base * 2^failures`, capped at `max`.
pub struct ExponentialBackoff<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<K, u32>>,
}

impl<K: Eq + Hash + Clone> ExponentialBackoff<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, failures: Mutex::new(FxHashMap::default()) }
    }

    fn delay_for(&self, exp: u32) -> Duration {
        2u32.checked_pow(exp)
            .and_then(|m| self.base.checked_mul(m))
            .map_or(self.max, |d| d.min(self.max))
    }
}

impl<K: Eq + Hash + Clone + Send> RateLimiter<K> for ExponentialBackoff<K> {
    fn when(&self, item: &K) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let n = failures.entry(item.clone()).or_insert(0);
        let exp = *n;
        *n = n.saturating_add(1);
        self.delay_for(exp)
    }

    fn forget(&self, item: &K) {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).remove(item);
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).get(item).copied().unwrap_or(0)
    }
}

/// `fast` for the first `max_fast` attempts, `slow` afterwards.
pub struct FastSlow<K> {
    fast: Duration,
    slow: Duration,
    max_fast: u32,
    attempts: Mutex<FxHashMap<K, u32>>,
}

impl<K: Eq + Hash + Clone> FastSlow<K> {
    pub fn new(fast: Duration, slow: Duration, max_fast: u32) -> Self {
        Self { fast, slow, max_fast, attempts: Mutex::new(FxHashMap::default()) }
    }
}

impl<K: Eq + Hash + Clone + Send> RateLimiter<K> for FastSlow<K> {
    fn when(&self, item: &K) -> Duration {
        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        let n = attempts.entry(item.clone()).or_insert(0);
        *n = n.saturating_add(1);
        if *n <= self.max_fast { self.fast } else { self.slow }
    }

    fn forget(&self, item: &K) {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner).remove(item);
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner).get(item).copied().unwrap_or(0)
    }
}

/// Overall token bucket shared by all items; does not track requeues.
///
/// A qps that is zero, negative or NaN never refills: once the burst is spent
/// every item is delayed by `Duration::MAX`.
pub struct TokenBucket {
    qps: f64,
    burst: f64,
    state: Mutex<(f64, Instant)>,
}

impl TokenBucket {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        let qps = if qps > 0.0 { qps.min(f64::MAX) } else { 0.0 };
        Self { qps, burst, state: Mutex::new((burst, Instant::now())) }
    }
}

impl<K> RateLimiter<K> for TokenBucket {
    fn when(&self, _item: &K) -> Duration {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let (tokens, last) = *state;
        let refilled = (tokens + now.duration_since(last).as_secs_f64() * self.qps).min(self.burst);
        let left = refilled - 1.0;
        *state = (left, now);
        if left >= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-left / self.qps).unwrap_or(Duration::MAX)
        }
    }

    fn forget(&self, _item: &K) {}

    fn num_requeues(&self, _item: &K) -> u32 { 0 }
}

/// Worst case of several limiters.
pub struct MaxOf<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOf<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self { Self { limiters } }
}

impl<K> RateLimiter<K> for MaxOf<K> {
    fn when(&self, item: &K) -> Duration {
        self.limiters.iter().map(|l| l.when(item)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &K) {
        for l in &self.limiters {
            l.forget(item);
        }
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.limiters.iter().map(|l| l.num_requeues(item)).max().unwrap_or(0)
    }
}

/// Per-item exponential backoff (5ms .. 1000s) combined with an overall 10 qps / 100 burst bucket.
pub fn default_controller_rate_limiter<K>() -> MaxOf<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    MaxOf::new(vec![
        Box::new(ExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1000))),
        Box::new(TokenBucket::new(10.0, 100)),
    ])
}

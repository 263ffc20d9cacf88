//! Recon work queue: deduplicating, rate-limited queue of keys awaiting reconciliation.
//!
//! A key is at most once in the pending set and at most once being processed.
//! Adding a key while it is processed marks it dirty; `done` puts it back.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub mod limiter;

pub use limiter::{default_controller_rate_limiter, ExponentialBackoff, FastSlow, MaxOf, RateLimiter, TokenBucket};

/// Longest delay `add_after` honours; larger delays are clamped to it.
const MAX_DELAY: Duration = Duration::from_secs(86400 * 365 * 30);

struct State<K> {
    queue: VecDeque<K>,
    /// Keys that need processing: queued, or processing and re-added.
    dirty: FxHashSet<K>,
    processing: FxHashSet<K>,
    /// Keys waiting out a delay, with the deadline that will fire.
    waiting: FxHashMap<K, Instant>,
    shutting_down: bool,
}

pub struct WorkQueue<K> {
    name: String,
    state: Mutex<State<K>>,
    item_ready: Notify,
    drained: Notify,
    shutdown: CancellationToken,
    limiter: Box<dyn RateLimiter<K>>,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    /// Queue using the default controller rate limiter.
    pub fn new(name: &str) -> Arc<Self> {
        Self::with_rate_limiter(name, Box::new(default_controller_rate_limiter()))
    }

    pub fn with_rate_limiter(name: &str, limiter: Box<dyn RateLimiter<K>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: FxHashSet::default(),
                processing: FxHashSet::default(),
                waiting: FxHashMap::default(),
                shutting_down: false,
            }),
            item_ready: Notify::new(),
            drained: Notify::new(),
            shutdown: CancellationToken::new(),
            limiter,
        })
    }

    pub fn name(&self) -> &str { &self.name }

    /// Number of keys ready to be handed out.
    pub fn len(&self) -> usize { self.lock().queue.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }

    /// Enqueue `key` unless it is already pending. A key being processed is
    /// marked to run again once `done` is called for it.
    pub fn add(&self, key: K) {
        let mut st = self.lock();
        if st.shutting_down || st.dirty.contains(&key) {
            return;
        }
        counter!("workqueue_adds_total", 1u64, "name" => self.name.clone());
        st.dirty.insert(key.clone());
        if st.processing.contains(&key) {
            trace!(key = ?key, "key busy; marked dirty");
            return;
        }
        st.queue.push_back(key);
        gauge!("workqueue_depth", st.queue.len() as f64, "name" => self.name.clone());
        drop(st);
        self.item_ready.notify_one();
    }

    /// Wait for the next key. `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.item_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if let Some(key) = st.queue.pop_front() {
                    st.dirty.remove(&key);
                    st.processing.insert(key.clone());
                    gauge!("workqueue_depth", st.queue.len() as f64, "name" => self.name.clone());
                    let more = !st.queue.is_empty();
                    drop(st);
                    if more {
                        self.item_ready.notify_one();
                    }
                    return Some(key);
                }
                if st.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark `key` as finished. A key re-added meanwhile is queued again.
    pub fn done(&self, key: &K) {
        let mut st = self.lock();
        st.processing.remove(key);
        let requeued = st.dirty.contains(key);
        if requeued {
            st.queue.push_back(key.clone());
        }
        let idle = st.processing.is_empty();
        drop(st);
        if requeued {
            self.item_ready.notify_one();
        }
        if idle {
            self.drained.notify_waiters();
        }
    }

    /// Add `key` once `delay` has elapsed. If the key is already waiting, the
    /// earlier deadline wins. Pending delays are dropped on shutdown.
    ///
    /// Must be called from within a tokio runtime.
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let deadline = Instant::now() + delay.min(MAX_DELAY);
        {
            let mut st = self.lock();
            if st.shutting_down {
                return;
            }
            match st.waiting.get(&key) {
                Some(existing) if *existing <= deadline => return,
                _ => {
                    st.waiting.insert(key.clone(), deadline);
                }
            }
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = this.shutdown.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    let fire = {
                        let mut st = this.lock();
                        if st.waiting.get(&key) == Some(&deadline) {
                            st.waiting.remove(&key);
                            true
                        } else {
                            false
                        }
                    };
                    if fire {
                        this.add(key);
                    }
                }
            }
        });
    }

    /// Re-add `key` after its rate-limited delay and count one more requeue.
    pub fn add_rate_limited(self: &Arc<Self>, key: K) {
        let delay = self.limiter.when(&key);
        counter!("workqueue_retries_total", 1u64, "name" => self.name.clone());
        debug!(key = ?key, delay_ms = delay.as_millis() as u64, "rate-limited requeue");
        self.add_after(key, delay);
    }

    /// Reset the retry counter of `key`.
    pub fn forget(&self, key: &K) { self.limiter.forget(key); }

    pub fn num_requeues(&self, key: &K) -> u32 { self.limiter.num_requeues(key) }

    /// Stop accepting keys. Blocked and future `get` calls return `None` once
    /// the remaining keys are handed out.
    pub fn shut_down(&self) {
        {
            let mut st = self.lock();
            if st.shutting_down {
                return;
            }
            st.shutting_down = true;
            st.waiting.clear();
        }
        debug!(queue = %self.name, "work queue shutting down");
        self.shutdown.cancel();
        self.item_ready.notify_waiters();
    }

    /// Shut down, then wait until every handed-out key has been marked done.
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

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//! List-then-watch driver that keeps a [`LocalCache`] in step with a remote store.
//!
//! The reflector lists once, bulk-loads the cache, marks it synced and then
//! watches from the listed version. A dropped stream resumes from the last
//! seen version; an expired version forces a relist. Every applied change is
//! fanned out to the registered handlers in delivery order.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::StreamExt;
use metrics::counter;
use recon_core::{EventKind, EventStream, ListFilter, Listing, RemoteError, RemoteEvent, RemoteResourceApi, WatchEvent};
use thiserror::Error;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::LocalCache;

/// Receives every change the reflector applies to the cache.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &WatchEvent);
}

impl<F> EventHandler for F
where
    F: Fn(&WatchEvent) + Send + Sync,
{
    fn on_event(&self, event: &WatchEvent) { self(event) }
}

#[derive(Debug, Clone)]
pub struct ReflectorConfig {
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Give up after this many list/watch failures in a row. `None` retries forever.
    pub max_consecutive_failures: Option<u32>,
    /// Redeliver every cached object as `Updated` on this period.
    pub resync_period: Option<Duration>,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            backoff_initial: Duration::from_millis(800),
            backoff_max: Duration::from_secs(30),
            max_consecutive_failures: None,
            resync_period: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReflectorError {
    #[error("remote store: {0}")]
    Remote(#[from] RemoteError),
    #[error("giving up after {failures} consecutive list/watch failures: {last}")]
    TooManyFailures { failures: u32, last: RemoteError },
}

enum WatchEnd {
    Stopped,
    Disconnected { version: String, progressed: bool },
    Expired { reason: String, progressed: bool },
    Failed { version: String, error: RemoteError },
}

struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self { Self { initial, max, current: initial } }

    fn next(&mut self) -> Duration {
        let d = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        d
    }

    fn reset(&mut self) { self.current = self.initial; }
}

pub struct Reflector {
    api: Arc<dyn RemoteResourceApi>,
    filter: ListFilter,
    cache: Arc<LocalCache>,
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
    config: ReflectorConfig,
}

impl Reflector {
    pub fn new(api: Arc<dyn RemoteResourceApi>, filter: ListFilter, cache: Arc<LocalCache>) -> Self {
        Self::with_config(api, filter, cache, ReflectorConfig::default())
    }

    pub fn with_config(
        api: Arc<dyn RemoteResourceApi>,
        filter: ListFilter,
        cache: Arc<LocalCache>,
        config: ReflectorConfig,
    ) -> Self {
        Self { api, filter, cache, handlers: RwLock::new(Vec::new()), config }
    }

    pub fn cache(&self) -> &Arc<LocalCache> { &self.cache }
    pub fn filter(&self) -> &ListFilter { &self.filter }

    pub fn has_synced(&self) -> bool { self.cache.has_synced() }

    /// Register a handler. A handler joining after the initial sync first
    /// receives the current cache content as `Added` events. Registration
    /// waits for a listing in progress to finish.
    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if self.cache.has_synced() {
            for obj in self.cache.list() {
                handler.on_event(&WatchEvent::new(EventKind::Added, obj));
            }
        }
        handlers.push(handler);
    }

    /// Run list+watch until `stop` fires or a non-recoverable error occurs.
    pub async fn run(&self, stop: CancellationToken) -> Result<(), ReflectorError> {
        info!(filter = ?self.filter, "reflector started");
        let mut version: Option<String> = None;
        let mut failures = 0u32;
        let mut backoff = Backoff::new(self.config.backoff_initial, self.config.backoff_max);

        while !stop.is_cancelled() {
            let rv = match version.take() {
                Some(rv) => rv,
                None => {
                    let listed = tokio::select! {
                        _ = stop.cancelled() => break,
                        r = self.api.list(&self.filter) => r,
                    };
                    match listed {
                        // Failures reset only once a watch makes progress.
                        Ok(listing) => self.apply_listing(listing),
                        Err(e) => {
                            self.record_failure(e, &mut failures)?;
                            if !pause(backoff.next(), &stop).await { break; }
                            continue;
                        }
                    }
                }
            };

            let opened = tokio::select! {
                _ = stop.cancelled() => break,
                r = self.api.watch(&rv, &self.filter) => r,
            };
            let mut stream = match opened {
                Ok(s) => s,
                Err(RemoteError::Expired(msg)) => {
                    info!(version = %rv, reason = %msg, "resume version expired; relisting");
                    self.record_failure(RemoteError::Expired(msg), &mut failures)?;
                    if !pause(backoff.next(), &stop).await { break; }
                    continue;
                }
                Err(e) => {
                    version = Some(rv);
                    self.record_failure(e, &mut failures)?;
                    if !pause(backoff.next(), &stop).await { break; }
                    continue;
                }
            };

            counter!("reflector_watch_restarts_total", 1u64);
            match self.consume(&mut stream, rv, &stop).await {
                WatchEnd::Stopped => break,
                WatchEnd::Disconnected { version: v, progressed } => {
                    debug!(version = %v, progressed, "watch stream closed; resuming");
                    version = Some(v);
                    if progressed {
                        failures = 0;
                        backoff.reset();
                    } else if !pause(backoff.next(), &stop).await {
                        break;
                    }
                }
                WatchEnd::Expired { reason, progressed } => {
                    info!(progressed, reason = %reason, "watch reported expired version; relisting");
                    if progressed {
                        failures = 0;
                        backoff.reset();
                    } else {
                        self.record_failure(RemoteError::Expired(reason), &mut failures)?;
                        if !pause(backoff.next(), &stop).await { break; }
                    }
                }
                WatchEnd::Failed { version: v, error } => {
                    version = Some(v);
                    self.record_failure(error, &mut failures)?;
                    if !pause(backoff.next(), &stop).await { break; }
                }
            }
        }
        info!("reflector stopped");
        Ok(())
    }

    fn record_failure(&self, error: RemoteError, failures: &mut u32) -> Result<(), ReflectorError> {
        if error.is_fatal() {
            return Err(ReflectorError::Remote(error));
        }
        *failures = failures.saturating_add(1);
        warn!(error = %error, failures = *failures, "list/watch failed");
        match self.config.max_consecutive_failures {
            Some(max) if *failures > max => Err(ReflectorError::TooManyFailures { failures: *failures, last: error }),
            _ => Ok(()),
        }
    }

    fn apply_listing(&self, listing: Listing) -> String {
        let count = listing.items.len();
        // Held until synced so add_handler sees either none of the listing or all of it.
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        for ev in self.cache.replace(listing.items) {
            fan_out(&handlers, &ev);
        }
        self.cache.mark_synced();
        drop(handlers);
        counter!("reflector_relists_total", 1u64);
        info!(items = count, version = %listing.version, "listed and synced");
        listing.version
    }

    async fn consume(&self, stream: &mut EventStream, mut version: String, stop: &CancellationToken) -> WatchEnd {
        let mut resync = self.config.resync_period.map(|p| {
            let mut i = tokio::time::interval_at(Instant::now() + p, p);
            i.set_missed_tick_behavior(MissedTickBehavior::Delay);
            i
        });
        let mut progressed = false;
        loop {
            let next = tokio::select! {
                _ = stop.cancelled() => return WatchEnd::Stopped,
                _ = tick(&mut resync) => {
                    self.resync();
                    continue;
                }
                ev = stream.next() => ev,
            };
            match next {
                None => return WatchEnd::Disconnected { version, progressed },
                Some(Ok(ev)) => {
                    progressed = true;
                    if let Some(v) = self.apply_remote(ev) {
                        version = v;
                    }
                }
                Some(Err(RemoteError::Expired(reason))) => return WatchEnd::Expired { reason, progressed },
                Some(Err(error)) => return WatchEnd::Failed { version, error },
            }
        }
    }

    /// Apply one remote change to the cache and fan it out. Returns the new resume version.
    fn apply_remote(&self, ev: RemoteEvent) -> Option<String> {
        let (kind, obj) = match ev {
            RemoteEvent::Bookmark { version } => return non_empty(version),
            RemoteEvent::Added(o) | RemoteEvent::Modified(o) => {
                let obj = Arc::new(o);
                match self.cache.upsert(Arc::clone(&obj)) {
                    Some(_) => (EventKind::Updated, obj),
                    None => (EventKind::Added, obj),
                }
            }
            RemoteEvent::Deleted(o) => {
                self.cache.delete(&o.key);
                (EventKind::Deleted, Arc::new(o))
            }
        };
        let version = non_empty(obj.version.clone());
        self.dispatch(&WatchEvent::new(kind, obj));
        version
    }

    fn resync(&self) {
        let items = self.cache.list();
        debug!(items = items.len(), "resync");
        for obj in items {
            self.dispatch(&WatchEvent::new(EventKind::Updated, obj));
        }
    }

    fn dispatch(&self, ev: &WatchEvent) {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        fan_out(&handlers, ev);
    }
}

fn fan_out(handlers: &[Arc<dyn EventHandler>], ev: &WatchEvent) {
    counter!("reflector_events_total", 1u64, "kind" => kind_label(ev.kind));
    for h in handlers {
        h.on_event(ev);
    }
}

fn kind_label(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Added => "added",
        EventKind::Updated => "updated",
        EventKind::Deleted => "deleted",
    }
}

fn non_empty(v: String) -> Option<String> {
    if v.is_empty() { None } else { Some(v) }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Sleep unless stopped first. Returns false when stopped.
async fn pause(d: Duration, stop: &CancellationToken) -> bool {
    tokio::select! {
        _ = stop.cancelled() => false,
        _ = tokio::time::sleep(d) => true,
    }
}

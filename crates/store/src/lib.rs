//! Recon store: key-indexed object cache and the reflector that fills it.

#![forbid(unsafe_code)]

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use recon_core::{EventKind, ObjectKey, ResourceObject, WatchEvent};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::watch;
use tracing::debug;

pub mod reflector;

pub use reflector::{EventHandler, Reflector, ReflectorConfig, ReflectorError};

/// In-memory mirror of remote state, keyed by object identity.
///
/// Entries are swapped as whole `Arc`s so readers never see a half-applied object.
pub struct LocalCache {
    items: RwLock<FxHashMap<ObjectKey, Arc<ResourceObject>>>,
    synced: watch::Sender<bool>,
}

impl Default for LocalCache {
    fn default() -> Self { Self::new() }
}

impl LocalCache {
    pub fn new() -> Self {
        let (synced, _) = watch::channel(false);
        Self { items: RwLock::new(FxHashMap::default()), synced }
    }

    pub fn len(&self) -> usize { self.read().len() }
    pub fn is_empty(&self) -> bool { self.read().is_empty() }

    /// Insert or replace; returns the previous state for this key, if any.
    pub fn upsert(&self, obj: Arc<ResourceObject>) -> Option<Arc<ResourceObject>> {
        self.write().insert(obj.key.clone(), obj)
    }

    pub fn delete(&self, key: &ObjectKey) -> Option<Arc<ResourceObject>> {
        self.write().remove(key)
    }

    pub fn get_by_key(&self, key: &ObjectKey) -> Option<Arc<ResourceObject>> {
        self.read().get(key).cloned()
    }

    pub fn list(&self) -> Vec<Arc<ResourceObject>> {
        self.read().values().cloned().collect()
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.read().keys().cloned().collect()
    }

    /// Swap the whole content for a fresh listing and return the events that
    /// take a reader of the old content to the new one. Objects missing from
    /// the listing come back as `Deleted` with their last known state.
    pub fn replace(&self, items: Vec<ResourceObject>) -> Vec<WatchEvent> {
        let mut map = self.write();
        let mut events = Vec::with_capacity(items.len());
        let mut seen = FxHashSet::default();
        for obj in items {
            let obj = Arc::new(obj);
            seen.insert(obj.key.clone());
            let kind = match map.insert(obj.key.clone(), Arc::clone(&obj)) {
                Some(_) => EventKind::Updated,
                None => EventKind::Added,
            };
            events.push(WatchEvent::new(kind, obj));
        }
        let gone: Vec<ObjectKey> = map.keys().filter(|k| !seen.contains(*k)).cloned().collect();
        for key in gone {
            if let Some(old) = map.remove(&key) {
                events.push(WatchEvent::new(EventKind::Deleted, old));
            }
        }
        debug!(items = map.len(), events = events.len(), "cache replaced");
        events
    }

    pub fn has_synced(&self) -> bool { *self.synced.borrow() }

    pub fn mark_synced(&self) {
        self.synced.send_if_modified(|s| {
            let changed = !*s;
            *s = true;
            changed
        });
    }

    /// Wait until the initial listing has been applied. Returns false on timeout.
    pub async fn wait_for_sync(&self, timeout: Duration) -> bool {
        let mut rx = self.synced.subscribe();
        let res = tokio::time::timeout(timeout, rx.wait_for(|s| *s)).await.map(|r| r.is_ok());
        matches!(res, Ok(true))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, FxHashMap<ObjectKey, Arc<ResourceObject>>> {
        self.items.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, FxHashMap<ObjectKey, Arc<ResourceObject>>> {
        self.items.write().unwrap_or_else(PoisonError::into_inner)
    }
}

use std::sync::Arc;

use recon_core::{EventKind, ObjectKey, WatchEvent};
use recon_queue::WorkQueue;
use recon_store::EventHandler;
use tracing::trace;

/// Turns every delivered event into a key on the work queue.
///
/// Deletes are enqueued like any other change; the reconcile step decides
/// whether the object still exists by looking at the cache.
pub struct EventTranslator {
    queue: Arc<WorkQueue<ObjectKey>>,
}

impl EventTranslator {
    pub fn new(queue: Arc<WorkQueue<ObjectKey>>) -> Self { Self { queue } }
}

impl EventHandler for EventTranslator {
    fn on_event(&self, event: &WatchEvent) {
        let key = event.key().clone();
        if event.kind == EventKind::Deleted {
            trace!(key = %key, "delete observed");
        }
        self.queue.add(key);
    }
}

//! Fixed-size pool of workers draining the queue.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use metrics::{counter, histogram};
use recon_core::{ObjectKey, ReconcileError};
use recon_queue::WorkQueue;
use recon_store::LocalCache;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{ErrorObserver, Reconciler};

/// What a worker needs to process one key; cheap to clone.
#[derive(Clone)]
pub struct WorkerPool {
    pub(crate) queue: Arc<WorkQueue<ObjectKey>>,
    pub(crate) cache: Arc<LocalCache>,
    pub(crate) reconciler: Arc<dyn Reconciler>,
    pub(crate) observer: Arc<dyn ErrorObserver>,
    pub(crate) max_retries: u32,
    pub(crate) drop_permanent: bool,
}

impl WorkerPool {
    /// Start `workers` tasks. Each runs until the queue reports shutdown.
    pub fn spawn(&self, workers: usize) -> Vec<JoinHandle<()>> {
        (0..workers)
            .map(|id| {
                let pool = self.clone();
                tokio::spawn(async move {
                    debug!(worker = id, "worker started");
                    while pool.process_next_item().await {}
                    debug!(worker = id, "worker exited");
                })
            })
            .collect()
    }

    /// Wait for spawned workers, reporting any that crashed.
    pub async fn join(handles: Vec<JoinHandle<()>>) {
        for res in futures::future::join_all(handles).await {
            if let Err(e) = res {
                error!(error = %e, "worker task failed");
            }
        }
    }

    /// Take one key and reconcile it. Returns false once the queue is shut down.
    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        let started = Instant::now();
        let result = match AssertUnwindSafe(self.sync(&key)).catch_unwind().await {
            Ok(r) => r,
            Err(_) => Err(ReconcileError::transient("reconcile panicked")),
        };
        self.handle_result(&key, result);
        self.queue.done(&key);
        histogram!("controller_reconcile_ms", started.elapsed().as_secs_f64() * 1000.0);
        true
    }

    async fn sync(&self, key: &ObjectKey) -> Result<(), ReconcileError> {
        match self.cache.get_by_key(key) {
            Some(obj) => self.reconciler.reconcile(obj).await,
            None => {
                debug!(key = %key, "object no longer exists");
                self.reconciler.cleanup(key).await;
                Ok(())
            }
        }
    }

    fn handle_result(&self, key: &ObjectKey, result: Result<(), ReconcileError>) {
        let err = match result {
            Ok(()) => {
                counter!("controller_reconcile_total", 1u64, "outcome" => "ok");
                self.queue.forget(key);
                return;
            }
            Err(ReconcileError::NotFound(msg)) => {
                debug!(key = %key, reason = %msg, "object vanished during reconcile");
                counter!("controller_reconcile_total", 1u64, "outcome" => "ok");
                self.queue.forget(key);
                return;
            }
            Err(e) => e,
        };
        let permanent = matches!(err, ReconcileError::Permanent(_));
        // This failure is attempt number `num_requeues + 1`.
        let failures = self.queue.num_requeues(key).saturating_add(1);
        if failures < self.max_retries && !(permanent && self.drop_permanent) {
            counter!("controller_reconcile_total", 1u64, "outcome" => "retry");
            info!(key = %key, error = %err, failures, "error syncing; requeueing");
            self.queue.add_rate_limited(key.clone());
            return;
        }
        counter!("controller_reconcile_total", 1u64, "outcome" => "dropped");
        warn!(key = %key, failures, "giving up on key");
        self.queue.forget(key);
        self.observer.observe(key, &err);
    }
}

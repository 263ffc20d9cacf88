use metrics::counter;
use recon_core::{ObjectKey, ReconcileError};
use tracing::error;

/// Sink for reconcile failures the controller gave up on.
pub trait ErrorObserver: Send + Sync {
    fn observe(&self, key: &ObjectKey, error: &ReconcileError);
}

/// Logs and counts dropped keys.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl ErrorObserver for LoggingObserver {
    fn observe(&self, key: &ObjectKey, error: &ReconcileError) {
        counter!("controller_dropped_total", 1u64);
        error!(key = %key, error = %error, "dropping key out of the queue");
    }
}

use std::sync::Arc;

use recon_core::{ObjectKey, ReconcileError, ResourceObject};

/// Brings local behavior in line with an object's cached state.
///
/// Must be idempotent: the same state can be delivered more than once.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, obj: Arc<ResourceObject>) -> Result<(), ReconcileError>;

    /// The key is no longer in the cache. Cannot fail.
    async fn cleanup(&self, _key: &ObjectKey) {}
}

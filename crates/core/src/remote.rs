//! Contract for the authoritative remote resource store.

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::{RemoteError, ResourceObject};

/// Narrows which objects a list/watch observes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilter {
    /// `None` means all namespaces.
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

impl ListFilter {
    pub fn namespace(ns: impl Into<String>) -> Self {
        Self { namespace: Some(ns.into()), ..Self::default() }
    }
}

/// Point-in-time list result and the version to start watching from.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub items: Vec<ResourceObject>,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    Added(ResourceObject),
    Modified(ResourceObject),
    Deleted(ResourceObject),
    /// Progress marker; advances the resume version without a change.
    Bookmark { version: String },
}

/// Watch stream; ends when the connection drops.
pub type EventStream = BoxStream<'static, Result<RemoteEvent, RemoteError>>;

#[async_trait::async_trait]
pub trait RemoteResourceApi: Send + Sync {
    async fn list(&self, filter: &ListFilter) -> Result<Listing, RemoteError>;

    /// Watch changes after `version`.
    async fn watch(&self, version: &str, filter: &ListFilter) -> Result<EventStream, RemoteError>;
}

//! Recon core types: object identity, watch events and the remote store contract.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub mod error;
pub mod remote;

pub use error::{KeyError, ReconcileError, RemoteError};
pub use remote::{EventStream, ListFilter, Listing, RemoteEvent, RemoteResourceApi};

pub type Uid = [u8; 16];

/// Identity of a tracked object and the unit of queueing.
///
/// Encoded as `namespace/name`, or just `name` for cluster-scoped objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }

    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self::new(Some(namespace), name)
    }

    pub fn cluster(name: &str) -> Self {
        Self::new(None, name)
    }

    /// Parse a `namespace/name` or `name` key.
    pub fn parse(key: &str) -> Result<Self, KeyError> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::cluster(name)),
            [ns, name] if !ns.is_empty() && !name.is_empty() => Ok(Self::namespaced(ns, name)),
            _ => Err(KeyError::Invalid(key.to_string())),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl std::str::FromStr for ObjectKey {
    type Err = KeyError;
    fn from_str(s: &str) -> Result<Self, Self::Err> { Self::parse(s) }
}

/// Most recently observed snapshot of one remote object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceObject {
    pub key: ObjectKey,
    /// Opaque, monotonically advancing version token (resourceVersion).
    pub version: String,
    pub uid: Option<Uid>,
    pub payload: serde_json::Value,
}

impl ResourceObject {
    pub fn new(key: ObjectKey, version: impl Into<String>, payload: serde_json::Value) -> Self {
        Self { key, version: version.into(), uid: None, payload }
    }

    /// Decode identity and version from a raw object's `metadata` block.
    pub fn from_raw(raw: serde_json::Value) -> Result<Self, KeyError> {
        let meta = raw.get("metadata").ok_or(KeyError::MissingField("metadata"))?;
        let name = meta
            .get("name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or(KeyError::MissingField("metadata.name"))?;
        let namespace = meta.get("namespace").and_then(|v| v.as_str()).filter(|s| !s.is_empty());
        let version = meta.get("resourceVersion").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let uid = match meta.get("uid").and_then(|v| v.as_str()) {
            Some(s) => Some(parse_uid(s)?),
            None => None,
        };
        Ok(Self { key: ObjectKey::new(namespace, name), version, uid, payload: raw })
    }
}

fn parse_uid(uid_str: &str) -> Result<Uid, KeyError> {
    let u = uuid::Uuid::parse_str(uid_str).map_err(|_| KeyError::InvalidUid(uid_str.to_string()))?;
    Ok(*u.as_bytes())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventKind {
    Added,
    Updated,
    Deleted,
}

/// Change notification delivered by the reflector to its handlers.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: EventKind,
    /// For `Deleted`, the last state known before removal.
    pub object: Arc<ResourceObject>,
}

impl WatchEvent {
    pub fn new(kind: EventKind, object: Arc<ResourceObject>) -> Self { Self { kind, object } }
    pub fn key(&self) -> &ObjectKey { &self.object.key }
}

pub mod prelude {
    pub use super::{
        EventKind, EventStream, KeyError, ListFilter, Listing, ObjectKey, ReconcileError, RemoteError,
        RemoteEvent, RemoteResourceApi, ResourceObject, Uid, WatchEvent,
    };
}

//! Error taxonomy shared across crates.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid resource key: {0:?}")]
    Invalid(String),
    #[error("object missing {0}")]
    MissingField(&'static str),
    #[error("invalid object uid: {0}")]
    InvalidUid(String),
}

/// Failures reported by a remote resource store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// The resume version is too old; a full relist is required.
    #[error("resource version expired: {0}")]
    Expired(String),
    /// Connection-level or server-side hiccup; reconnecting may help.
    #[error("transient remote error: {0}")]
    Transient(String),
    /// Not recoverable by retrying (bad credentials, unknown resource, ...).
    #[error("fatal remote error: {0}")]
    Fatal(String),
}

impl RemoteError {
    pub fn is_fatal(&self) -> bool { matches!(self, RemoteError::Fatal(_)) }
}

/// Outcome of a failed reconcile step.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReconcileError {
    /// Retryable with backoff.
    #[error("transient: {0}")]
    Transient(String),
    /// Retrying will not help.
    #[error("permanent: {0}")]
    Permanent(String),
    /// The object is gone; treated as already deleted.
    #[error("not found: {0}")]
    NotFound(String),
}

impl ReconcileError {
    pub fn transient(msg: impl Into<String>) -> Self { Self::Transient(msg.into()) }
    pub fn permanent(msg: impl Into<String>) -> Self { Self::Permanent(msg.into()) }
}

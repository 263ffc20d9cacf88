//! Recon controller: turns watch events into queued keys and reconciles them
//! with a fixed pool of workers once the cache has synced.

#![forbid(unsafe_code)]

mod controller;
mod observer;
mod reconciler;
mod translator;
mod worker;

pub use controller::{Controller, ControllerConfig, ControllerError, ControllerRunState};
pub use observer::{ErrorObserver, LoggingObserver};
pub use reconciler::Reconciler;
pub use translator::EventTranslator;
pub use worker::WorkerPool;

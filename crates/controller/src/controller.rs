use std::sync::Arc;
use std::time::Duration;

use recon_core::ObjectKey;
use recon_queue::WorkQueue;
use recon_store::{LocalCache, Reflector, ReflectorError};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{ErrorObserver, EventTranslator, LoggingObserver, Reconciler, WorkerPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerRunState {
    Initializing,
    CacheSyncing,
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Failed attempts after which a key is dropped. This counts attempts, not
    /// requeues: with 5 a key is reconciled at most 5 times (4 retries) before
    /// it is forgotten and reported. 0 and 1 both mean no retries.
    pub max_retries: u32,
    pub sync_timeout: Duration,
    /// Drop keys failing with a permanent error without retrying.
    pub drop_permanent: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { max_retries: 5, sync_timeout: Duration::from_secs(30), drop_permanent: false }
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("timed out after {0:?} waiting for caches to sync")]
    CacheSyncTimeout(Duration),
    #[error("stopped before caches synced")]
    StoppedBeforeSync,
    #[error("reflector failed: {0}")]
    Reflector(#[from] ReflectorError),
    #[error("reflector task crashed: {0}")]
    ReflectorPanicked(String),
}

type ReflectorTask = JoinHandle<Result<(), ReflectorError>>;

enum SyncOutcome {
    Synced,
    TimedOut,
    Stopped,
    ReflectorExited(Result<(), ControllerError>),
}

/// Runs a reflector and a worker pool over one queue and one cache.
pub struct Controller {
    queue: Arc<WorkQueue<ObjectKey>>,
    cache: Arc<LocalCache>,
    reflector: Arc<Reflector>,
    reconciler: Arc<dyn Reconciler>,
    observer: Arc<dyn ErrorObserver>,
    config: ControllerConfig,
    state: watch::Sender<ControllerRunState>,
}

impl Controller {
    /// Wire the reflector's events into `queue` and reconcile against its cache.
    pub fn new(queue: Arc<WorkQueue<ObjectKey>>, reflector: Arc<Reflector>, reconciler: Arc<dyn Reconciler>) -> Self {
        reflector.add_handler(Arc::new(EventTranslator::new(Arc::clone(&queue))));
        let (state, _) = watch::channel(ControllerRunState::Initializing);
        Self {
            queue,
            cache: Arc::clone(reflector.cache()),
            reflector,
            reconciler,
            observer: Arc::new(LoggingObserver),
            config: ControllerConfig::default(),
            state,
        }
    }

    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ErrorObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn queue(&self) -> &Arc<WorkQueue<ObjectKey>> { &self.queue }
    pub fn cache(&self) -> &Arc<LocalCache> { &self.cache }
    pub fn state(&self) -> ControllerRunState { *self.state.borrow() }
    pub fn subscribe_state(&self) -> watch::Receiver<ControllerRunState> { self.state.subscribe() }

    /// Run until `stop` fires. Workers only start once the cache has synced;
    /// shutdown stops the reflector, then drains the queue and the workers.
    pub async fn run(&self, workers: usize, stop: CancellationToken) -> Result<(), ControllerError> {
        info!(workers, "starting controller");
        self.set_state(ControllerRunState::Initializing);
        let reflector_stop = stop.child_token();
        let mut reflector_task: ReflectorTask = tokio::spawn({
            let reflector = Arc::clone(&self.reflector);
            let token = reflector_stop.clone();
            async move { reflector.run(token).await }
        });

        self.set_state(ControllerRunState::CacheSyncing);
        let outcome = tokio::select! {
            synced = self.cache.wait_for_sync(self.config.sync_timeout) => {
                if synced { SyncOutcome::Synced } else { SyncOutcome::TimedOut }
            }
            _ = stop.cancelled() => SyncOutcome::Stopped,
            res = &mut reflector_task => SyncOutcome::ReflectorExited(flatten(res)),
        };
        let abort = match outcome {
            SyncOutcome::Synced => None,
            SyncOutcome::TimedOut => Some(ControllerError::CacheSyncTimeout(self.config.sync_timeout)),
            SyncOutcome::Stopped => Some(ControllerError::StoppedBeforeSync),
            SyncOutcome::ReflectorExited(res) => Some(res.err().unwrap_or(ControllerError::StoppedBeforeSync)),
        };
        if let Some(err) = abort {
            error!(error = %err, "caches did not sync; not starting workers");
            self.set_state(ControllerRunState::ShuttingDown);
            reflector_stop.cancel();
            if !reflector_task.is_finished() {
                if let Err(e) = flatten(reflector_task.await) {
                    debug!(error = %e, "reflector exited after aborted sync");
                }
            }
            self.queue.shut_down();
            self.set_state(ControllerRunState::Stopped);
            return Err(err);
        }

        self.set_state(ControllerRunState::Running);
        let pool = WorkerPool {
            queue: Arc::clone(&self.queue),
            cache: Arc::clone(&self.cache),
            reconciler: Arc::clone(&self.reconciler),
            observer: Arc::clone(&self.observer),
            max_retries: self.config.max_retries,
            drop_permanent: self.config.drop_permanent,
        };
        let handles = pool.spawn(workers.max(1));
        info!(workers = handles.len(), "controller running");

        let reflector_result = tokio::select! {
            _ = stop.cancelled() => None,
            res = &mut reflector_task => Some(flatten(res)),
        };

        self.set_state(ControllerRunState::ShuttingDown);
        info!("stopping controller");
        let result = match reflector_result {
            Some(res) => {
                if let Err(e) = &res {
                    error!(error = %e, "reflector stopped unexpectedly");
                }
                res
            }
            None => {
                reflector_stop.cancel();
                flatten(reflector_task.await)
            }
        };
        self.queue.shut_down();
        WorkerPool::join(handles).await;
        self.set_state(ControllerRunState::Stopped);
        info!("controller stopped");
        result
    }

    fn set_state(&self, next: ControllerRunState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(from = ?prev, to = ?next, "controller state");
        }
    }
}

fn flatten(res: Result<Result<(), ReflectorError>, JoinError>) -> Result<(), ControllerError> {
    match res {
        Ok(inner) => inner.map_err(ControllerError::from),
        Err(e) => Err(ControllerError::ReflectorPanicked(e.to_string())),
    }
}

#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::channel::mpsc;
use futures::StreamExt;
use recon_controller::{Controller, ControllerConfig, ControllerError, ControllerRunState, ErrorObserver, Reconciler};
use recon_core::prelude::*;
use recon_queue::{ExponentialBackoff, WorkQueue};
use recon_store::{LocalCache, Reflector, ReflectorConfig, ReflectorError};
use tokio_util::sync::CancellationToken;

type Feed = mpsc::UnboundedSender<Result<RemoteEvent, RemoteError>>;

#[derive(Default)]
struct FakeApi {
    lists: Mutex<VecDeque<Result<Listing, RemoteError>>>,
    watches: Mutex<VecDeque<Result<EventStream, RemoteError>>>,
}

impl FakeApi {
    fn push_list(&self, version: &str, items: Vec<ResourceObject>) {
        self.lists.lock().unwrap().push_back(Ok(Listing { items, version: version.to_string() }));
    }
    fn push_watch(&self) -> Feed {
        let (tx, rx) = mpsc::unbounded();
        self.watches.lock().unwrap().push_back(Ok(rx.boxed()));
        tx
    }
    fn push_watch_err(&self, e: RemoteError) {
        self.watches.lock().unwrap().push_back(Err(e));
    }
}

#[async_trait::async_trait]
impl RemoteResourceApi for FakeApi {
    async fn list(&self, _filter: &ListFilter) -> Result<Listing, RemoteError> {
        let next = self.lists.lock().unwrap().pop_front();
        match next {
            Some(r) => r,
            None => futures::future::pending().await,
        }
    }

    async fn watch(&self, _version: &str, _filter: &ListFilter) -> Result<EventStream, RemoteError> {
        let next = self.watches.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(futures::stream::pending().boxed()))
    }
}

/// Records what each key was reconciled against; can be told to fail.
#[derive(Default)]
struct Recorder {
    attempts: Mutex<HashMap<String, u32>>,
    latest: Mutex<HashMap<String, String>>,
    cleaned: Mutex<Vec<String>>,
    in_flight: Mutex<HashSet<String>>,
    overlapped: AtomicBool,
    /// key -> (remaining failures, error to return)
    failures: Mutex<HashMap<String, (u32, ReconcileError)>>,
    panic_on: Mutex<HashSet<String>>,
}

impl Recorder {
    fn fail(&self, key: &str, times: u32, err: ReconcileError) {
        self.failures.lock().unwrap().insert(key.to_string(), (times, err));
    }
    fn attempts(&self, key: &str) -> u32 {
        self.attempts.lock().unwrap().get(key).copied().unwrap_or(0)
    }
    fn total_attempts(&self) -> u32 {
        self.attempts.lock().unwrap().values().sum()
    }
}

#[async_trait::async_trait]
impl Reconciler for Recorder {
    async fn reconcile(&self, obj: Arc<ResourceObject>) -> Result<(), ReconcileError> {
        let key = obj.key.to_string();
        if !self.in_flight.lock().unwrap().insert(key.clone()) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        *self.attempts.lock().unwrap().entry(key.clone()).or_insert(0) += 1;
        tokio::time::sleep(Duration::from_millis(1)).await;
        self.in_flight.lock().unwrap().remove(&key);
        if self.panic_on.lock().unwrap().contains(&key) {
            panic!("boom for {key}");
        }
        let failure = {
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(&key) {
                Some((left, err)) if *left > 0 => {
                    *left -= 1;
                    Some(err.clone())
                }
                _ => None,
            }
        };
        if let Some(err) = failure {
            return Err(err);
        }
        self.latest.lock().unwrap().insert(key, obj.version.clone());
        Ok(())
    }

    async fn cleanup(&self, key: &ObjectKey) {
        self.cleaned.lock().unwrap().push(key.to_string());
    }
}

#[derive(Default)]
struct Observed(Mutex<Vec<(String, ReconcileError)>>);

impl Observed {
    fn reports(&self) -> Vec<(String, ReconcileError)> { self.0.lock().unwrap().clone() }
}

impl ErrorObserver for Observed {
    fn observe(&self, key: &ObjectKey, error: &ReconcileError) {
        self.0.lock().unwrap().push((key.to_string(), error.clone()));
    }
}

fn obj(name: &str, rv: &str) -> ResourceObject {
    ResourceObject::new(ObjectKey::namespaced("ns", name), rv, serde_json::json!({ "rv": rv }))
}

struct Harness {
    controller: Arc<Controller>,
    recorder: Arc<Recorder>,
    observed: Arc<Observed>,
}

fn harness(api: Arc<FakeApi>, config: ControllerConfig) -> Harness {
    let cache = Arc::new(LocalCache::new());
    let reflector_config = ReflectorConfig {
        backoff_initial: Duration::from_millis(5),
        backoff_max: Duration::from_millis(20),
        ..ReflectorConfig::default()
    };
    let reflector = Arc::new(Reflector::with_config(api, ListFilter::default(), cache, reflector_config));
    let queue = WorkQueue::with_rate_limiter(
        "test",
        Box::new(ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(10))),
    );
    let recorder = Arc::new(Recorder::default());
    let observed = Arc::new(Observed::default());
    let controller = Controller::new(queue, reflector, recorder.clone())
        .with_config(config)
        .with_observer(observed.clone());
    Harness { controller: Arc::new(controller), recorder, observed }
}

fn run(
    controller: &Arc<Controller>,
    workers: usize,
    stop: &CancellationToken,
) -> tokio::task::JoinHandle<Result<(), ControllerError>> {
    let c = Arc::clone(controller);
    let token = stop.clone();
    tokio::spawn(async move { c.run(workers, token).await })
}

async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..600 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for: {what}");
}

#[tokio::test]
async fn sync_timeout_aborts_without_starting_workers() {
    let api = Arc::new(FakeApi::default());
    let config = ControllerConfig { sync_timeout: Duration::from_millis(50), ..ControllerConfig::default() };
    let h = harness(api, config);
    // A key queued before sync would be handed to any worker that started.
    h.controller.queue().add(ObjectKey::namespaced("ns", "early"));

    let err = h.controller.run(2, CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ControllerError::CacheSyncTimeout(_)));
    assert_eq!(h.controller.state(), ControllerRunState::Stopped);
    assert_eq!(h.recorder.total_attempts(), 0);
    assert!(h.recorder.cleaned.lock().unwrap().is_empty());
    assert!(h.controller.queue().is_shutting_down());
    assert_eq!(h.controller.queue().len(), 1, "no worker took the queued key");
}

#[tokio::test]
async fn stop_before_sync_aborts() {
    let api = Arc::new(FakeApi::default());
    let h = harness(api, ControllerConfig::default());
    let stop = CancellationToken::new();
    let task = run(&h.controller, 1, &stop);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.controller.state(), ControllerRunState::CacheSyncing);
    stop.cancel();
    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, ControllerError::StoppedBeforeSync));
    assert_eq!(h.recorder.total_attempts(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_keys_converge_to_latest_state() {
    let api = Arc::new(FakeApi::default());
    let items: Vec<_> = (0..100).map(|i| obj(&format!("o{i}"), "1")).collect();
    api.push_list("1", items);
    let feed = api.push_watch();
    let h = harness(Arc::clone(&api), ControllerConfig::default());
    let stop = CancellationToken::new();
    let task = run(&h.controller, 3, &stop);

    for i in (0..100).step_by(3) {
        feed.unbounded_send(Ok(RemoteEvent::Modified(obj(&format!("o{i}"), "2")))).unwrap();
        feed.unbounded_send(Ok(RemoteEvent::Modified(obj(&format!("o{i}"), "3")))).unwrap();
    }

    let expected: HashMap<String, String> = (0..100)
        .map(|i| (format!("ns/o{i}"), if i % 3 == 0 { "3".to_string() } else { "1".to_string() }))
        .collect();
    eventually("latest state reconciled", || *h.recorder.latest.lock().unwrap() == expected).await;
    assert!(!h.recorder.overlapped.load(Ordering::SeqCst), "a key was processed by two workers at once");
    assert_eq!(h.controller.state(), ControllerRunState::Running);

    stop.cancel();
    task.await.unwrap().unwrap();
    assert_eq!(h.controller.state(), ControllerRunState::Stopped);
    assert!(h.observed.reports().is_empty());
}

#[tokio::test]
async fn repeated_failures_drop_key_once() {
    let api = Arc::new(FakeApi::default());
    api.push_list("1", vec![obj("a", "1"), obj("b", "1")]);
    let h = harness(api, ControllerConfig { max_retries: 5, ..ControllerConfig::default() });
    h.recorder.fail("ns/b", u32::MAX, ReconcileError::transient("backend down"));
    let stop = CancellationToken::new();
    let task = run(&h.controller, 1, &stop);

    eventually("key dropped", || h.observed.reports().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.recorder.attempts("ns/b"), 5);
    assert_eq!(h.controller.queue().num_requeues(&ObjectKey::namespaced("ns", "b")), 0);
    let reports = h.observed.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0, "ns/b");
    assert_eq!(reports[0].1, ReconcileError::transient("backend down"));

    stop.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn max_retries_counts_attempts_not_requeues() {
    let api = Arc::new(FakeApi::default());
    api.push_list("1", vec![obj("a", "1")]);
    let h = harness(api, ControllerConfig { max_retries: 1, ..ControllerConfig::default() });
    h.recorder.fail("ns/a", u32::MAX, ReconcileError::transient("backend down"));
    let stop = CancellationToken::new();
    let task = run(&h.controller, 1, &stop);

    eventually("key dropped", || h.observed.reports().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.recorder.attempts("ns/a"), 1);
    assert_eq!(h.observed.reports().len(), 1);

    stop.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn success_is_not_requeued_and_retries_recover() {
    let api = Arc::new(FakeApi::default());
    api.push_list("1", vec![obj("ok", "1"), obj("flaky", "1")]);
    let h = harness(api, ControllerConfig::default());
    h.recorder.fail("ns/flaky", 2, ReconcileError::transient("try again"));
    let stop = CancellationToken::new();
    let task = run(&h.controller, 2, &stop);

    eventually("flaky recovered", || h.recorder.latest.lock().unwrap().contains_key("ns/flaky")).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.recorder.attempts("ns/ok"), 1);
    assert_eq!(h.recorder.attempts("ns/flaky"), 3);
    assert_eq!(h.controller.queue().num_requeues(&ObjectKey::namespaced("ns", "flaky")), 0);
    assert!(h.observed.reports().is_empty());

    stop.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn deleted_objects_take_the_cleanup_path() {
    let api = Arc::new(FakeApi::default());
    api.push_list("1", vec![obj("a", "1")]);
    let feed = api.push_watch();
    let h = harness(Arc::clone(&api), ControllerConfig::default());
    let stop = CancellationToken::new();
    let task = run(&h.controller, 1, &stop);

    eventually("initial reconcile", || h.recorder.attempts("ns/a") == 1).await;
    feed.unbounded_send(Ok(RemoteEvent::Deleted(obj("a", "2")))).unwrap();
    eventually("cleanup ran", || h.recorder.cleaned.lock().unwrap().as_slice() == ["ns/a"]).await;
    assert_eq!(h.recorder.attempts("ns/a"), 1);
    assert!(h.observed.reports().is_empty());

    stop.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn permanent_errors_can_skip_retries() {
    let api = Arc::new(FakeApi::default());
    api.push_list("1", vec![obj("bad", "1")]);
    let config = ControllerConfig { drop_permanent: true, ..ControllerConfig::default() };
    let h = harness(api, config);
    h.recorder.fail("ns/bad", u32::MAX, ReconcileError::permanent("invalid spec"));
    let stop = CancellationToken::new();
    let task = run(&h.controller, 1, &stop);

    eventually("dropped", || h.observed.reports().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.recorder.attempts("ns/bad"), 1);

    stop.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn not_found_from_reconciler_is_not_retried() {
    let api = Arc::new(FakeApi::default());
    api.push_list("1", vec![obj("gone", "1")]);
    let h = harness(api, ControllerConfig::default());
    h.recorder.fail("ns/gone", u32::MAX, ReconcileError::NotFound("deleted upstream".into()));
    let stop = CancellationToken::new();
    let task = run(&h.controller, 1, &stop);

    eventually("attempted", || h.recorder.attempts("ns/gone") == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.recorder.attempts("ns/gone"), 1);
    assert!(h.observed.reports().is_empty());

    stop.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn panicking_reconcile_is_retried_then_dropped() {
    let api = Arc::new(FakeApi::default());
    api.push_list("1", vec![obj("p", "1"), obj("fine", "1")]);
    let h = harness(api, ControllerConfig { max_retries: 2, ..ControllerConfig::default() });
    h.recorder.panic_on.lock().unwrap().insert("ns/p".to_string());
    let stop = CancellationToken::new();
    let task = run(&h.controller, 1, &stop);

    eventually("dropped", || h.observed.reports().len() == 1).await;
    assert_eq!(h.recorder.attempts("ns/p"), 2);
    assert!(h.recorder.latest.lock().unwrap().contains_key("ns/fine"));

    stop.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn fatal_reflector_error_fails_run() {
    let api = Arc::new(FakeApi::default());
    api.push_list("1", vec![obj("a", "1")]);
    api.push_watch_err(RemoteError::Fatal("unauthorized".into()));
    let h = harness(api, ControllerConfig::default());

    let err = h.controller.run(1, CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ControllerError::Reflector(ReflectorError::Remote(RemoteError::Fatal(_)))));
    assert_eq!(h.controller.state(), ControllerRunState::Stopped);
}

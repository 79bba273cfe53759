//! End-to-end tests of the controller over a channel-fed informer.
//!
//! Each test builds an informer on a [`ChannelSource`], wires it to a
//! controller and drives the source by hand.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use informer_workqueue_controller::config::{ControllerConfig, RateLimitConfig};
use informer_workqueue_controller::controller::{
    CancellationToken, Controller, ControllerError, ControllerState, FunctionReconciler,
    ReconcileError, Reconciler,
};
use informer_workqueue_controller::informer::{EventHandler, Informer, Watcher};
use informer_workqueue_controller::rate_limiting_queue::RateLimitingQueue;
use informer_workqueue_controller::rate_limiter::default_controller_rate_limiter;
use informer_workqueue_controller::source::{ChannelSource, SourceHandle, WatchError};
use informer_workqueue_controller::store::{KeyedStore, MemoryStore, ObjectKey};

#[derive(Debug, Clone)]
struct Obj {
    namespace: String,
    name: String,
    version: u32,
}

impl Obj {
    fn new(namespace: &str, name: &str, version: u32) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            version,
        }
    }
}

impl ObjectKey for Obj {
    fn namespace(&self) -> Option<&str> {
        Some(&self.namespace)
    }

    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

/// Configuration with delays short enough for tests.
fn test_config() -> ControllerConfig {
    ControllerConfig {
        rate_limit: RateLimitConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            qps: 1000.0,
            burst: 100,
        },
        cache_sync_timeout: Duration::from_secs(5),
        shutdown_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

fn channel_informer() -> (Arc<Informer<Obj>>, SourceHandle<Obj>) {
    let (source, handle) = ChannelSource::channel();
    (Arc::new(Informer::new(Arc::new(source))), handle)
}

/// Polls `cond` until it holds, panicking after five seconds.
async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Runs `controller` in the background until the returned token fires.
fn start<T>(
    controller: &Arc<Controller<T>>,
    workers: usize,
) -> (
    CancellationToken,
    tokio::task::JoinHandle<Result<(), ControllerError>>,
)
where
    T: ObjectKey + Send + Sync + 'static,
{
    let cancel = CancellationToken::new();
    let task = tokio::spawn(controller.clone().run(workers, cancel.clone()));
    (cancel, task)
}

/// Records every reconciled key.
struct Recorder {
    seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Reconciler for Recorder {
    async fn reconcile(&self, key: &str) -> Result<(), ReconcileError> {
        self.seen.lock().unwrap().push(key.to_string());
        Ok(())
    }
}

fn recording_reconciler(seen: Arc<Mutex<Vec<String>>>) -> Recorder {
    Recorder { seen }
}

#[tokio::test]
async fn test_reconciles_every_listed_object() {
    let (informer, handle) = channel_informer();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let controller = Arc::new(Controller::new(
        "objects",
        test_config(),
        informer.clone(),
        Arc::new(recording_reconciler(seen.clone())),
    ));
    assert_eq!(controller.state(), ControllerState::Constructed);

    handle.list(vec![
        Obj::new("ns", "a", 1),
        Obj::new("ns", "b", 1),
        Obj::new("other", "c", 1),
    ]);

    let (cancel, task) = start(&controller, 2);
    wait_until(|| seen.lock().unwrap().len() == 3).await;
    wait_until(|| controller.is_ready()).await;
    assert_eq!(controller.state(), ControllerState::Running);

    let mut keys = seen.lock().unwrap().clone();
    keys.sort();
    assert_eq!(keys, vec!["ns/a", "ns/b", "other/c"]);

    cancel.cancel();
    task.await.unwrap().unwrap();
    assert_eq!(controller.state(), ControllerState::Stopped);
    assert!(controller.queue().is_shutting_down());
}

#[tokio::test]
async fn test_failing_key_is_dropped_after_max_retries() {
    let (informer, handle) = channel_informer();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let reconciler = FunctionReconciler::new(move |key: String| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ReconcileError::failed(key, "backend unavailable"))
        }
    });
    let controller = Arc::new(Controller::new(
        "objects",
        test_config(),
        informer.clone(),
        Arc::new(reconciler),
    ));

    handle.list(vec![Obj::new("ns", "bad", 1)]);

    let (cancel, task) = start(&controller, 1);
    wait_until(|| attempts.load(Ordering::SeqCst) == 6).await;

    // No seventh attempt once the key is dropped.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 6);
    assert_eq!(controller.queue().num_requeues(&"ns/bad".to_string()), 0);
    assert!(controller.queue().is_empty());

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_permanent_error_is_not_retried() {
    let (informer, handle) = channel_informer();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let reconciler = FunctionReconciler::new(move |key: String| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ReconcileError::permanent(key, "malformed spec"))
        }
    });
    let controller = Arc::new(Controller::new(
        "objects",
        test_config(),
        informer.clone(),
        Arc::new(reconciler),
    ));

    handle.list(vec![Obj::new("ns", "broken", 1)]);

    let (cancel, task) = start(&controller, 1);
    wait_until(|| attempts.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(controller.queue().num_requeues(&"ns/broken".to_string()), 0);

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_panicking_reconcile_is_retried() {
    let (informer, handle) = channel_informer();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let reconciler = FunctionReconciler::new(move |_key: String| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("reconciler bug");
            }
            Ok::<(), ReconcileError>(())
        }
    });
    let controller = Arc::new(Controller::new(
        "objects",
        test_config(),
        informer.clone(),
        Arc::new(reconciler),
    ));

    handle.list(vec![Obj::new("ns", "a", 1)]);

    let (cancel, task) = start(&controller, 1);
    wait_until(|| attempts.load(Ordering::SeqCst) == 2).await;
    wait_until(|| controller.queue().num_requeues(&"ns/a".to_string()) == 0).await;
    assert_eq!(controller.state(), ControllerState::Running);

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_deleted_object_is_reconciled_as_absent() {
    let (informer, handle) = channel_informer();
    let store: Arc<dyn KeyedStore<Obj>> = informer.store();
    let observed = Arc::new(Mutex::new(Vec::new()));
    let log = observed.clone();
    let reconciler = FunctionReconciler::new(move |key: String| {
        let store = store.clone();
        let log = log.clone();
        async move {
            let obj = store.get_by_key(&key).map_err(|source| ReconcileError::CacheLookup {
                key: key.clone(),
                source,
            })?;
            log.lock().unwrap().push((key, obj.map(|o| o.version)));
            Ok::<(), ReconcileError>(())
        }
    });
    let controller = Arc::new(Controller::new(
        "objects",
        test_config(),
        informer.clone(),
        Arc::new(reconciler),
    ));

    handle.list(vec![Obj::new("ns", "a", 1)]);

    let (cancel, task) = start(&controller, 1);
    wait_until(|| observed.lock().unwrap().len() == 1).await;

    handle.apply(Obj::new("ns", "a", 2));
    wait_until(|| observed.lock().unwrap().len() == 2).await;

    handle.delete(Obj::new("ns", "a", 2));
    wait_until(|| observed.lock().unwrap().len() == 3).await;

    assert_eq!(
        *observed.lock().unwrap(),
        vec![
            ("ns/a".to_string(), Some(1)),
            ("ns/a".to_string(), Some(2)),
            ("ns/a".to_string(), None),
        ]
    );

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_change_during_reconcile_is_processed_after_it() {
    let (informer, handle) = channel_informer();
    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));
    let calls = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(Notify::new());

    let reconciler = {
        let (active, max_active, calls, release) =
            (active.clone(), max_active.clone(), calls.clone(), release.clone());
        FunctionReconciler::new(move |_key: String| {
            let (active, max_active, calls, release) =
                (active.clone(), max_active.clone(), calls.clone(), release.clone());
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    release.notified().await;
                }
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<(), ReconcileError>(())
            }
        })
    };
    let controller = Arc::new(Controller::new(
        "objects",
        test_config(),
        informer.clone(),
        Arc::new(reconciler),
    ));

    handle.list(vec![Obj::new("ns", "a", 1)]);

    let (cancel, task) = start(&controller, 4);
    wait_until(|| calls.load(Ordering::SeqCst) == 1).await;

    // The key is in flight: the update is held back, not handed to another
    // worker.
    handle.apply(Obj::new("ns", "a", 2));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    release.notify_one();
    wait_until(|| calls.load(Ordering::SeqCst) == 2).await;
    assert_eq!(max_active.load(Ordering::SeqCst), 1);

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_run_twice_fails() {
    let (informer, _handle) = channel_informer();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let controller = Arc::new(Controller::new(
        "objects",
        test_config(),
        informer.clone(),
        Arc::new(recording_reconciler(seen)),
    ));

    let (cancel, task) = start(&controller, 1);
    wait_until(|| controller.state() == ControllerState::Running).await;

    let second = controller.clone().run(1, CancellationToken::new()).await;
    assert!(matches!(second, Err(ControllerError::AlreadyStarted(name)) if name == "objects"));

    cancel.cancel();
    task.await.unwrap().unwrap();
    assert_eq!(controller.state(), ControllerState::Stopped);
}

#[tokio::test]
async fn test_workers_start_after_cache_sync_timeout() {
    let (informer, handle) = channel_informer();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let config = ControllerConfig {
        cache_sync_timeout: Duration::from_millis(200),
        ..test_config()
    };
    let controller = Arc::new(Controller::new(
        "objects",
        config,
        informer.clone(),
        Arc::new(recording_reconciler(seen.clone())),
    ));

    // Never listed, so the cache never syncs.
    handle.apply(Obj::new("ns", "a", 1));

    let (cancel, task) = start(&controller, 1);
    wait_until(|| seen.lock().unwrap().len() == 1).await;
    assert!(!controller.has_synced());
    assert!(!controller.is_ready());

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_cancel_before_sync_stops_cleanly() {
    let (informer, _handle) = channel_informer();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let controller = Arc::new(Controller::new(
        "objects",
        test_config(),
        informer.clone(),
        Arc::new(recording_reconciler(seen.clone())),
    ));

    let (cancel, task) = start(&controller, 2);
    cancel.cancel();
    task.await.unwrap().unwrap();

    assert_eq!(controller.state(), ControllerState::Stopped);
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_shutdown_lets_in_flight_reconcile_finish() {
    let (informer, handle) = channel_informer();
    let started = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    let reconciler = {
        let (started, finished) = (started.clone(), finished.clone());
        FunctionReconciler::new(move |_key: String| {
            let (started, finished) = (started.clone(), finished.clone());
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(500)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok::<(), ReconcileError>(())
            }
        })
    };
    // Far shorter than the reconcile: only reported, never enforced.
    let config = ControllerConfig {
        shutdown_timeout: Duration::from_millis(50),
        ..test_config()
    };
    let controller = Arc::new(Controller::new(
        "objects",
        config,
        informer.clone(),
        Arc::new(reconciler),
    ));

    handle.list(vec![Obj::new("ns", "slow", 1)]);

    let (cancel, task) = start(&controller, 1);
    wait_until(|| started.load(Ordering::SeqCst) == 1).await;

    cancel.cancel();
    task.await.unwrap().unwrap();

    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(controller.state(), ControllerState::Stopped);
}

#[test]
fn test_controller_is_built_outside_a_runtime() {
    let (informer, _handle) = channel_informer();
    let controller = Controller::new(
        "objects",
        test_config(),
        informer,
        Arc::new(recording_reconciler(Arc::default())),
    );

    controller.queue().add("ns/a".to_string());
    assert_eq!(controller.queue().len(), 1);
    assert_eq!(controller.state(), ControllerState::Constructed);
}

struct FailingWatcher {
    store: Arc<MemoryStore<Obj>>,
}

#[async_trait]
impl Watcher<Obj> for FailingWatcher {
    fn add_event_handler(&self, _handler: Arc<dyn EventHandler<Obj>>) {}

    async fn run(&self, _cancel: CancellationToken) -> Result<(), WatchError> {
        Err(WatchError::Source("connection refused".into()))
    }

    fn has_synced(&self) -> bool {
        false
    }

    fn store(&self) -> Arc<dyn KeyedStore<Obj>> {
        self.store.clone()
    }
}

#[tokio::test]
async fn test_watcher_start_failure_is_returned() {
    let watcher = Arc::new(FailingWatcher {
        store: Arc::new(MemoryStore::new()),
    });
    let seen = Arc::new(Mutex::new(Vec::new()));
    let controller = Arc::new(Controller::new(
        "objects",
        test_config(),
        watcher,
        Arc::new(recording_reconciler(seen)),
    ));

    let result = controller.clone().run(1, CancellationToken::new()).await;
    assert!(matches!(result, Err(ControllerError::StartFailed { .. })));
    assert_eq!(controller.state(), ControllerState::Stopped);
}

#[tokio::test]
async fn test_queue_scenario() {
    let queue = RateLimitingQueue::new(Arc::new(default_controller_rate_limiter::<String>()));

    queue.add("ns/a".to_string());
    queue.add("ns/a".to_string());
    queue.add("ns/a".to_string());
    assert_eq!(queue.len(), 1);

    let key = queue.get().await.unwrap();
    assert_eq!(key, "ns/a");
    assert!(queue.is_empty());

    // Re-added while in flight: held until done.
    queue.add("ns/a".to_string());
    assert!(queue.is_empty());
    queue.done(&key);
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.get().await.unwrap(), "ns/a");
    queue.done(&key);

    queue.shut_down();
    assert_eq!(queue.get().await, None);
}

// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Reconciliation controller.
//!
//! The controller bridges a [`Watcher`] to a [`RateLimitingQueue`] and runs a
//! pool of workers that hand each queued key to a [`Reconciler`].

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

// Re-export cancellation token for use in the controller interface
pub use tokio_util::sync::CancellationToken;

use crate::config::ControllerConfig;
use crate::informer::{EventHandler, Watcher};
use crate::rate_limiter::controller_rate_limiter;
use crate::rate_limiting_queue::RateLimitingQueue;
use crate::source::WatchError;
use crate::store::{deletion_handling_key, DeletedObject, KeyedStore, ObjectKey, StoreError};

/// How often to check whether the cache has synced.
const CACHE_SYNC_POLL_PERIOD: Duration = Duration::from_millis(100);

/// Errors that can occur when running a controller.
#[derive(Error, Debug)]
pub enum ControllerError {
    /// `run` was called more than once.
    #[error("controller {0} has already been started")]
    AlreadyStarted(String),

    /// The watcher exited with an error before the cache synced.
    #[error("controller {name} failed to start: {source}")]
    StartFailed {
        /// Controller name.
        name: String,
        /// Watcher error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Result type for controller operations.
pub type Result<T> = std::result::Result<T, ControllerError>;

/// Errors returned by a [`Reconciler`].
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// Reading the object from the cache failed.
    #[error("failed to get {key} from cache: {source}")]
    CacheLookup {
        /// Object key.
        key: String,
        /// Store error.
        #[source]
        source: StoreError,
    },

    /// A transient failure, retried with backoff.
    #[error("failed to reconcile {key}: {source}")]
    Failed {
        /// Object key.
        key: String,
        /// Underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A failure retrying cannot fix.
    #[error("cannot reconcile {key}: {reason}")]
    Permanent {
        /// Object key.
        key: String,
        /// Why the object cannot be reconciled.
        reason: String,
    },

    /// The reconciler panicked.
    #[error("reconcile of {key} panicked: {message}")]
    Panicked {
        /// Object key.
        key: String,
        /// Panic payload.
        message: String,
    },
}

impl ReconcileError {
    /// A retryable failure.
    pub fn failed(
        key: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        ReconcileError::Failed {
            key: key.into(),
            source: source.into(),
        }
    }

    /// A failure that retrying cannot fix, such as a malformed object.
    pub fn permanent(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ReconcileError::Permanent {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if the key should be dropped without retrying.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ReconcileError::Permanent { .. })
    }
}

/// Application logic that drives one object towards its desired state.
///
/// The reconciler receives only the key; it reads the current state of the
/// object from the cache. A key whose object is absent from the cache
/// belongs to a deleted object.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Reconciles the object identified by `key`.
    async fn reconcile(&self, key: &str) -> std::result::Result<(), ReconcileError>;
}

/// A wrapper that converts a function into a [`Reconciler`].
///
/// # Example
///
/// ```rust
/// use informer_workqueue_controller::controller::{FunctionReconciler, ReconcileError};
///
/// let reconciler = FunctionReconciler::new(|key: String| async move {
///     println!("reconciling {key}");
///     Ok::<(), ReconcileError>(())
/// });
/// ```
pub struct FunctionReconciler<F, Fut>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), ReconcileError>> + Send,
{
    reconcile_fn: F,
}

impl<F, Fut> FunctionReconciler<F, Fut>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), ReconcileError>> + Send,
{
    /// Creates a new function-based reconciler.
    pub fn new(reconcile_fn: F) -> Self {
        Self { reconcile_fn }
    }
}

impl<F, Fut> fmt::Debug for FunctionReconciler<F, Fut>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), ReconcileError>> + Send,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionReconciler").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> Reconciler for FunctionReconciler<F, Fut>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), ReconcileError>> + Send + 'static,
{
    async fn reconcile(&self, key: &str) -> std::result::Result<(), ReconcileError> {
        (self.reconcile_fn)(key.to_string()).await
    }
}

/// What to do with a key after a reconcile attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Success: clear the key's failure history.
    Forget,
    /// Failure: retry later with backoff.
    Requeue,
    /// Failure: give up on the key and clear its failure history.
    Drop,
}

/// Bounded retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Requeues allowed before a failing key is dropped.
    pub max_retries: usize,
}

impl RetryPolicy {
    /// Decides the fate of a key given its reconcile result and the number
    /// of times it has already been requeued.
    pub fn decide(
        &self,
        result: &std::result::Result<(), ReconcileError>,
        num_requeues: usize,
    ) -> RetryDecision {
        match result {
            Ok(()) => RetryDecision::Forget,
            Err(e) if e.is_permanent() => RetryDecision::Drop,
            Err(_) if num_requeues < self.max_retries => RetryDecision::Requeue,
            Err(_) => RetryDecision::Drop,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 5 }
    }
}

/// Lifecycle of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerState {
    /// Created, `run` not called yet.
    Constructed,
    /// Watching and processing keys.
    Running,
    /// Stop requested, draining workers.
    ShuttingDown,
    /// All workers and the watcher have exited.
    Stopped,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ControllerState::Constructed => "constructed",
            ControllerState::Running => "running",
            ControllerState::ShuttingDown => "shutting-down",
            ControllerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Enqueues the key of every changed object.
struct QueueingHandler {
    queue: Arc<RateLimitingQueue<String>>,
}

impl<T: ObjectKey> EventHandler<T> for QueueingHandler {
    fn on_add(&self, obj: &T) {
        match obj.key() {
            Ok(key) => self.queue.add(key),
            Err(e) => tracing::warn!(error = %e, "cannot enqueue added object"),
        }
    }

    fn on_update(&self, _old: &T, new: &T) {
        match new.key() {
            Ok(key) => self.queue.add(key),
            Err(e) => tracing::warn!(error = %e, "cannot enqueue updated object"),
        }
    }

    fn on_delete(&self, obj: &DeletedObject<T>) {
        match deletion_handling_key(obj) {
            Ok(key) => self.queue.add(key),
            Err(e) => tracing::warn!(error = %e, "cannot enqueue deleted object"),
        }
    }
}

enum SyncOutcome {
    Synced,
    TimedOut,
    Cancelled,
    WatcherExited,
}

/// A level-triggered controller.
///
/// # Lifecycle
///
/// 1. The controller is created with [`Controller::new`]
/// 2. [`Controller::run`] registers with the watcher, starts it, waits for
///    the cache to sync and starts the workers
/// 3. When the cancellation token fires, the queue is shut down, in-flight
///    reconciles finish, and `run` returns once the workers and the watcher
///    have exited
pub struct Controller<T> {
    name: String,
    config: Arc<ControllerConfig>,
    queue: Arc<RateLimitingQueue<String>>,
    watcher: Arc<dyn Watcher<T>>,
    reconciler: Arc<dyn Reconciler>,
    policy: RetryPolicy,
    state: Mutex<ControllerState>,
}

impl<T> Controller<T>
where
    T: ObjectKey + Send + Sync + 'static,
{
    /// Creates a new controller.
    pub fn new(
        name: impl Into<String>,
        config: ControllerConfig,
        watcher: Arc<dyn Watcher<T>>,
        reconciler: Arc<dyn Reconciler>,
    ) -> Self {
        let limiter = Arc::new(controller_rate_limiter(&config.rate_limit));
        let policy = RetryPolicy {
            max_retries: config.max_retries,
        };

        Self {
            name: name.into(),
            config: Arc::new(config),
            queue: Arc::new(RateLimitingQueue::new(limiter)),
            watcher,
            reconciler,
            policy,
            state: Mutex::new(ControllerState::Constructed),
        }
    }

    /// Returns the name of this controller.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> ControllerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true while running with a synced cache.
    pub fn is_ready(&self) -> bool {
        self.state() == ControllerState::Running && self.watcher.has_synced()
    }

    /// Returns true once the watcher's cache has synced.
    pub fn has_synced(&self) -> bool {
        self.watcher.has_synced()
    }

    /// Returns the work queue.
    pub fn queue(&self) -> &Arc<RateLimitingQueue<String>> {
        &self.queue
    }

    /// Returns the cache the reconciler reads from.
    pub fn store(&self) -> Arc<dyn KeyedStore<T>> {
        self.watcher.store()
    }

    fn set_state(&self, state: ControllerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Runs the controller with `workers` concurrent workers until `cancel`
    /// fires.
    ///
    /// Reconcile errors never propagate out of `run`; the only error is a
    /// failure to start the watcher.
    pub async fn run(self: Arc<Self>, workers: usize, cancel: CancellationToken) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != ControllerState::Constructed {
                return Err(ControllerError::AlreadyStarted(self.name.clone()));
            }
            *state = ControllerState::Running;
        }

        tracing::info!(controller = %self.name, workers, "starting controller");

        self.watcher.add_event_handler(Arc::new(QueueingHandler {
            queue: self.queue.clone(),
        }));

        let mut watcher_task = Some(self.spawn_watcher(cancel.child_token()));

        match self.wait_for_cache_sync(&cancel, &watcher_task).await {
            SyncOutcome::Synced => {
                tracing::info!(controller = %self.name, "caches synced");
            }
            SyncOutcome::TimedOut => {
                tracing::error!(
                    controller = %self.name,
                    timeout = ?self.config.cache_sync_timeout,
                    "timed out waiting for caches to sync, starting workers anyway"
                );
            }
            SyncOutcome::Cancelled => {
                tracing::debug!(controller = %self.name, "cancelled before caches synced");
            }
            SyncOutcome::WatcherExited => {
                if let Some(task) = watcher_task.take() {
                    if let Err(source) = flatten_watcher_result(task.await) {
                        tracing::error!(controller = %self.name, error = %source, "watcher failed to start");
                        self.queue.shut_down();
                        self.set_state(ControllerState::Stopped);
                        return Err(ControllerError::StartFailed {
                            name: self.name.clone(),
                            source,
                        });
                    }
                }
            }
        }

        let mut join_set = JoinSet::new();
        for id in 0..workers {
            let controller = self.clone();
            join_set.spawn(async move { controller.run_worker(id).await });
        }

        cancel.cancelled().await;
        tracing::info!(controller = %self.name, "stop requested, shutting down controller");

        self.set_state(ControllerState::ShuttingDown);
        self.queue.shut_down();

        // In-flight reconciles always run to completion; the timeout only
        // marks when a slow shutdown is reported.
        let deadline = Instant::now() + self.config.shutdown_timeout;
        let mut reported = false;
        loop {
            tokio::select! {
                next = join_set.join_next() => match next {
                    Some(Ok(())) => {}
                    Some(Err(e)) => {
                        tracing::warn!(controller = %self.name, error = %e, "worker task failed");
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline), if !reported => {
                    reported = true;
                    tracing::warn!(
                        controller = %self.name,
                        workers = join_set.len(),
                        timeout = ?self.config.shutdown_timeout,
                        "shutdown timeout passed, still waiting for in-flight reconciles"
                    );
                }
            }
        }

        if let Some(task) = watcher_task {
            if let Err(e) = flatten_watcher_result(task.await) {
                tracing::warn!(controller = %self.name, error = %e, "watcher stopped with error");
            }
        }

        self.set_state(ControllerState::Stopped);
        tracing::info!(controller = %self.name, "controller stopped");
        Ok(())
    }

    fn spawn_watcher(
        &self,
        cancel: CancellationToken,
    ) -> JoinHandle<std::result::Result<(), WatchError>> {
        let watcher = self.watcher.clone();
        tokio::spawn(async move { watcher.run(cancel).await })
    }

    /// Waits until the cache has synced, the timeout elapses, `cancel` fires
    /// or the watcher exits.
    async fn wait_for_cache_sync(
        &self,
        cancel: &CancellationToken,
        watcher_task: &Option<JoinHandle<std::result::Result<(), WatchError>>>,
    ) -> SyncOutcome {
        let deadline = Instant::now() + self.config.cache_sync_timeout;
        let mut poll = tokio::time::interval(CACHE_SYNC_POLL_PERIOD);

        loop {
            if self.watcher.has_synced() {
                return SyncOutcome::Synced;
            }
            if watcher_task.as_ref().map_or(true, |task| task.is_finished()) {
                return SyncOutcome::WatcherExited;
            }
            if Instant::now() >= deadline {
                return SyncOutcome::TimedOut;
            }

            tokio::select! {
                _ = cancel.cancelled() => return SyncOutcome::Cancelled,
                _ = poll.tick() => {}
            }
        }
    }

    async fn run_worker(&self, id: usize) {
        tracing::debug!(controller = %self.name, worker = id, "worker started");
        while self.process_next_item().await {}
        tracing::debug!(controller = %self.name, worker = id, "worker stopped");
    }

    /// Processes one key from the queue.
    ///
    /// Returns `false` once the queue has been shut down and drained.
    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let result = AssertUnwindSafe(self.reconciler.reconcile(&key))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(ReconcileError::Panicked {
                    key: key.clone(),
                    message: panic_message(panic.as_ref()),
                })
            });

        // Done before handling the result, so a change observed during the
        // reconcile is queued again.
        self.queue.done(&key);
        self.handle_err(key, result);
        true
    }

    /// Applies the retry policy to a reconcile result.
    fn handle_err(&self, key: String, result: std::result::Result<(), ReconcileError>) {
        let num_requeues = self.queue.num_requeues(&key);
        match self.policy.decide(&result, num_requeues) {
            RetryDecision::Forget => {
                self.queue.forget(&key);
            }
            RetryDecision::Requeue => {
                if let Err(e) = &result {
                    tracing::info!(
                        controller = %self.name,
                        key = %key,
                        retries = num_requeues,
                        error = %e,
                        "error syncing, requeuing"
                    );
                }
                self.queue.add_rate_limited(key);
            }
            RetryDecision::Drop => {
                if let Err(e) = &result {
                    tracing::error!(
                        controller = %self.name,
                        key = %key,
                        retries = num_requeues,
                        error = %e,
                        "dropping key out of the queue"
                    );
                }
                self.queue.forget(&key);
            }
        }
    }
}

impl<T> fmt::Debug for Controller<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("name", &self.name)
            .field("queue", &self.queue)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

fn flatten_watcher_result(
    result: std::result::Result<std::result::Result<(), WatchError>, tokio::task::JoinError>,
) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Box::new(e)),
        Err(e) => Err(Box::new(e)),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

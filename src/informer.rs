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

//! Informer - keeps the local cache in sync and dispatches change callbacks.
//!
//! The informer consumes an [`EventSource`], applies every event to its
//! [`MemoryStore`] and only then notifies the registered [`EventHandler`]s,
//! so a handler always observes a cache that already reflects the change.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::rate_limiter::{ItemExponentialFailureRateLimiter, RateLimiter};
use crate::source::{EventSource, SourceEvent, WatchError};
use crate::store::{DeletedObject, KeyedStore, MemoryStore, ObjectKey};

/// Backoff applied after source errors.
const ERROR_BACKOFF_BASE: Duration = Duration::from_millis(800);
const ERROR_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Callbacks invoked when the cache changes.
pub trait EventHandler<T>: Send + Sync {
    /// An object was added to the cache.
    fn on_add(&self, obj: &T);

    /// An object in the cache was replaced. Also called with identical
    /// objects on resync.
    fn on_update(&self, old: &T, new: &T);

    /// An object was removed from the cache.
    fn on_delete(&self, obj: &DeletedObject<T>);
}

/// Watches a collection of objects and keeps a cache of them.
#[async_trait]
pub trait Watcher<T>: Send + Sync + 'static {
    /// Registers a handler for change notifications.
    fn add_event_handler(&self, handler: Arc<dyn EventHandler<T>>);

    /// Runs the watch loop until `cancel` fires.
    ///
    /// Returns an error only if the watcher cannot be started.
    async fn run(&self, cancel: CancellationToken) -> Result<(), WatchError>;

    /// Returns true once the initial list has been applied to the cache.
    fn has_synced(&self) -> bool;

    /// Returns the cache maintained by this watcher.
    fn store(&self) -> Arc<dyn KeyedStore<T>>;
}

/// Returns a resync period with up to 100% random jitter added, so that
/// informers created together do not resync at the same time.
pub fn jittered_resync_period(base: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.0..1.0);
    Duration::from_secs_f64(base.as_secs_f64() * (1.0 + jitter))
}

/// Event-source backed [`Watcher`].
pub struct Informer<T> {
    source: Arc<dyn EventSource<T>>,
    store: Arc<MemoryStore<T>>,
    handlers: RwLock<Vec<Arc<dyn EventHandler<T>>>>,
    resync_period: Option<Duration>,
    synced: AtomicBool,
    started: AtomicBool,
}

impl<T> Informer<T>
where
    T: ObjectKey + Send + Sync + 'static,
{
    /// Creates an informer reading from `source`.
    pub fn new(source: Arc<dyn EventSource<T>>) -> Self {
        Self {
            source,
            store: Arc::new(MemoryStore::new()),
            handlers: RwLock::new(Vec::new()),
            resync_period: None,
            synced: AtomicBool::new(false),
            started: AtomicBool::new(false),
        }
    }

    /// Enables periodic resync of every cached object.
    pub fn with_resync_period(mut self, period: Option<Duration>) -> Self {
        self.resync_period = period.filter(|p| !p.is_zero());
        self
    }

    /// Returns the typed cache.
    pub fn memory_store(&self) -> &Arc<MemoryStore<T>> {
        &self.store
    }

    fn handlers(&self) -> Vec<Arc<dyn EventHandler<T>>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Applies one source event to the cache, then notifies handlers.
    fn apply(&self, event: SourceEvent<T>) {
        match event {
            SourceEvent::Listed(objs) => self.replace(objs),
            SourceEvent::Applied(obj) => {
                let obj = Arc::new(obj);
                match self.store.upsert(obj.clone()) {
                    Ok(Some(old)) => {
                        for handler in self.handlers() {
                            handler.on_update(&old, &obj);
                        }
                    }
                    Ok(None) => {
                        for handler in self.handlers() {
                            handler.on_add(&obj);
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "dropping applied object"),
                }
            }
            SourceEvent::Deleted(obj) => {
                let key = match obj.key() {
                    Ok(key) => key,
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping deleted object");
                        return;
                    }
                };
                if let Err(e) = self.store.remove(&key) {
                    tracing::warn!(key = %key, error = %e, "failed to remove object from cache");
                    return;
                }
                let deleted = DeletedObject::Known(Arc::new(obj));
                for handler in self.handlers() {
                    handler.on_delete(&deleted);
                }
            }
        }
    }

    /// Replaces the cache with a full listing.
    ///
    /// Objects missing from the listing are reported as deleted with an
    /// unknown final state.
    fn replace(&self, objs: Vec<T>) {
        let objs: Vec<Arc<T>> = objs
            .into_iter()
            .filter_map(|obj| match obj.key() {
                Ok(_) => Some(Arc::new(obj)),
                Err(e) => {
                    tracing::warn!(error = %e, "dropping listed object");
                    None
                }
            })
            .collect();
        let mut previous = match self.store.replace(objs.clone()) {
            Ok(previous) => previous,
            Err(e) => {
                tracing::warn!(error = %e, "failed to replace cache contents");
                return;
            }
        };

        let handlers = self.handlers();
        for obj in &objs {
            let Ok(key) = obj.key() else { continue };
            match previous.remove(&key) {
                Some(old) => {
                    for handler in &handlers {
                        handler.on_update(&old, obj);
                    }
                }
                None => {
                    for handler in &handlers {
                        handler.on_add(obj);
                    }
                }
            }
        }

        for (key, obj) in previous {
            let deleted = DeletedObject::FinalStateUnknown { key, obj };
            for handler in &handlers {
                handler.on_delete(&deleted);
            }
        }

        if !self.synced.swap(true, Ordering::SeqCst) {
            tracing::info!(objects = objs.len(), "informer cache synced");
        }
    }

    /// Re-delivers every cached object as an update.
    fn resync(&self) {
        let handlers = self.handlers();
        let objs = self.store.list();
        tracing::debug!(objects = objs.len(), "resyncing informer cache");
        for obj in objs {
            for handler in &handlers {
                handler.on_update(&obj, &obj);
            }
        }
    }

    async fn watch_until_cancelled(&self, cancel: &CancellationToken) {
        let backoff: ItemExponentialFailureRateLimiter<()> =
            ItemExponentialFailureRateLimiter::new(ERROR_BACKOFF_BASE, ERROR_BACKOFF_MAX);
        let resync_period = self.resync_period.map(jittered_resync_period);
        let mut resync = tokio::time::interval(resync_period.unwrap_or(Duration::from_secs(3600)));
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        resync.tick().await;

        loop {
            let mut events = self.source.events();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = resync.tick(), if resync_period.is_some() => self.resync(),
                    event = events.next() => match event {
                        Some(Ok(event)) => {
                            backoff.forget(&());
                            self.apply(event);
                        }
                        Some(Err(e)) => {
                            let delay = backoff.when(&());
                            tracing::warn!(error = %e, delay = ?delay, "watch failed, backing off");
                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        None => {
                            tracing::debug!("event stream closed, reopening");
                            break;
                        }
                    },
                }
            }
        }
    }
}

#[async_trait]
impl<T> Watcher<T> for Informer<T>
where
    T: ObjectKey + Send + Sync + 'static,
{
    fn add_event_handler(&self, handler: Arc<dyn EventHandler<T>>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), WatchError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(WatchError::AlreadyStarted);
        }

        tracing::info!("starting informer");
        self.watch_until_cancelled(&cancel).await;
        tracing::info!("informer stopped");
        Ok(())
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    fn store(&self) -> Arc<dyn KeyedStore<T>> {
        self.store.clone()
    }
}

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

//! Sources of change events for the informer.

use std::sync::{Mutex, PoisonError};

use futures::stream::{self, BoxStream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors produced while watching objects.
#[derive(Error, Debug)]
pub enum WatchError {
    /// `run` was called more than once.
    #[error("informer has already been started")]
    AlreadyStarted,

    /// The underlying list/watch failed.
    #[error("event source failed: {0}")]
    Source(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// A change observed by an event source.
#[derive(Debug, Clone)]
pub enum SourceEvent<T> {
    /// The complete current set of objects, sent on (re)list.
    Listed(Vec<T>),

    /// An object was created or modified.
    Applied(T),

    /// An object was deleted.
    Deleted(T),
}

/// Produces change events for a collection of objects.
pub trait EventSource<T>: Send + Sync + 'static {
    /// Opens a stream of events.
    ///
    /// The stream should begin with a [`SourceEvent::Listed`] event. When it
    /// ends, the informer calls `events` again to reopen it.
    fn events(&self) -> BoxStream<'static, Result<SourceEvent<T>, WatchError>>;
}

/// An event source fed through a channel.
///
/// Useful for embedding the controller in a process that already receives
/// change notifications, and for tests.
pub struct ChannelSource<T> {
    rx: Mutex<Option<mpsc::UnboundedReceiver<Result<SourceEvent<T>, WatchError>>>>,
}

/// Sending half of a [`ChannelSource`].
#[derive(Debug)]
pub struct SourceHandle<T> {
    tx: mpsc::UnboundedSender<Result<SourceEvent<T>, WatchError>>,
}

impl<T> Clone for SourceHandle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send + 'static> ChannelSource<T> {
    /// Creates a source and the handle used to feed it.
    pub fn channel() -> (Self, SourceHandle<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                rx: Mutex::new(Some(rx)),
            },
            SourceHandle { tx },
        )
    }
}

impl<T: Send + 'static> EventSource<T> for ChannelSource<T> {
    fn events(&self) -> BoxStream<'static, Result<SourceEvent<T>, WatchError>> {
        let rx = self
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match rx {
            Some(rx) => stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (event, rx))
            })
            .boxed(),
            // The channel can only be consumed once; a reopened source
            // stays idle.
            None => stream::pending().boxed(),
        }
    }
}

impl<T> SourceHandle<T> {
    /// Sends the full current set of objects.
    pub fn list(&self, objs: Vec<T>) -> bool {
        self.tx.send(Ok(SourceEvent::Listed(objs))).is_ok()
    }

    /// Sends a create or update.
    pub fn apply(&self, obj: T) -> bool {
        self.tx.send(Ok(SourceEvent::Applied(obj))).is_ok()
    }

    /// Sends a delete.
    pub fn delete(&self, obj: T) -> bool {
        self.tx.send(Ok(SourceEvent::Deleted(obj))).is_ok()
    }

    /// Sends an error.
    pub fn fail(&self, err: impl std::error::Error + Send + Sync + 'static) -> bool {
        self.tx.send(Err(WatchError::Source(Box::new(err)))).is_ok()
    }
}

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

//! Deduplicating work queue.
//!
//! The queue guarantees that:
//! - a key is pending at most once, no matter how often it is added,
//! - a key is never handed to two consumers at the same time,
//! - a key added while it is being processed is delivered again after
//!   [`WorkQueue::done`].

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

#[derive(Debug)]
struct State<K> {
    /// Pending keys in delivery order.
    queue: VecDeque<K>,

    /// Keys that need processing, pending or re-added while in flight.
    dirty: HashSet<K>,

    /// Keys handed out by `get` and not yet `done`.
    processing: HashSet<K>,

    shutting_down: bool,
}

/// A FIFO of keys with deduplication and per-key serialization.
pub struct WorkQueue<K> {
    state: Mutex<State<K>>,

    /// Wakes consumers blocked in `get`.
    items_available: Notify,

    /// Wakes `shut_down_with_drain` when in-flight work completes.
    processing_done: Notify,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash,
{
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            items_available: Notify::new(),
            processing_done: Notify::new(),
        }
    }

    /// Marks a key as needing processing.
    ///
    /// Adding a key that is already pending is a no-op. Adding a key that is
    /// currently being processed schedules it for redelivery once the
    /// consumer calls [`WorkQueue::done`]. Adds after shutdown are ignored.
    pub fn add(&self, key: K) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }

        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }

        state.queue.push_back(key);
        drop(state);
        self.items_available.notify_one();
    }

    /// Waits for the next key to process.
    ///
    /// Returns `None` once the queue is shut down and every pending key has
    /// been handed out. The caller must call [`WorkQueue::done`] with the
    /// returned key when it has finished processing it.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.items_available.notified();
            tokio::pin!(notified);
            // Register before checking state so a concurrent `add` or
            // `shut_down` cannot slip between the check and the wait.
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Marks a key as done processing.
    ///
    /// If the key was added again while it was being processed, it becomes
    /// pending again.
    pub fn done(&self, key: &K) {
        let mut state = self.lock();
        if !state.processing.remove(key) {
            return;
        }

        let requeue = state.dirty.contains(key);
        if requeue {
            state.queue.push_back(key.clone());
        }
        let drained = state.processing.is_empty();
        drop(state);

        if requeue {
            self.items_available.notify_one();
        }
        if drained {
            self.processing_done.notify_waiters();
        }
    }

    /// Closes the queue.
    ///
    /// Subsequent adds are ignored; consumers drain the pending keys and then
    /// receive `None` from [`WorkQueue::get`].
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.items_available.notify_waiters();
    }

    /// Closes the queue and waits until every in-flight key is done.
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let notified = self.processing_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.lock().processing.is_empty() {
                return;
            }

            notified.await;
        }
    }

    /// Returns true once [`WorkQueue::shut_down`] has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Returns the number of pending keys.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Returns true if no key is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of keys currently being processed.
    pub fn in_flight(&self) -> usize {
        self.lock().processing.len()
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        // Every critical section leaves the state consistent, so a poisoned
        // lock is still safe to use.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> fmt::Debug for WorkQueue<K>
where
    K: Clone + Eq + Hash,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("WorkQueue")
            .field("pending", &state.queue.len())
            .field("processing", &state.processing.len())
            .field("shutting_down", &state.shutting_down)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::time::Duration;

    use proptest::prelude::*;

    #[tokio::test]
    async fn test_add_deduplicates_pending_keys() {
        let queue = WorkQueue::new();
        queue.add("ns/a".to_string());
        queue.add("ns/a".to_string());
        queue.add("ns/a".to_string());
        assert_eq!(queue.len(), 1);

        let key = queue.get().await.unwrap();
        assert_eq!(key, "ns/a");
        assert!(queue.is_empty());
        queue.done(&key);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_add_while_processing_redelivers_after_done() {
        let queue = WorkQueue::new();
        queue.add("ns/a".to_string());

        let key = queue.get().await.unwrap();
        queue.add("ns/a".to_string());
        queue.add("ns/a".to_string());
        // Not deliverable while in flight.
        assert_eq!(queue.len(), 0);

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.unwrap(), "ns/a");
    }

    #[tokio::test]
    async fn test_preserves_fifo_order() {
        let queue = WorkQueue::new();
        for key in ["a", "b", "c", "a"] {
            queue.add(key);
        }

        assert_eq!(queue.get().await, Some("a"));
        assert_eq!(queue.get().await, Some("b"));
        assert_eq!(queue.get().await, Some("c"));
    }

    #[tokio::test]
    async fn test_shut_down_drains_pending_keys() {
        let queue = WorkQueue::new();
        queue.add(1);
        queue.add(2);
        queue.shut_down();
        queue.add(3);

        assert!(queue.is_shutting_down());
        assert_eq!(queue.get().await, Some(1));
        assert_eq!(queue.get().await, Some(2));
        assert_eq!(queue.get().await, None);
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn test_shut_down_wakes_blocked_consumers() {
        let queue = Arc::new(WorkQueue::<u32>::new());

        let mut handles = Vec::new();
        for _ in 0..3 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move { queue.get().await }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.shut_down();

        for handle in handles {
            let result = tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .expect("consumer was not woken")
                .unwrap();
            assert_eq!(result, None);
        }
    }

    #[tokio::test]
    async fn test_add_wakes_blocked_consumer() {
        let queue = Arc::new(WorkQueue::new());

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.add("ns/a");

        let key = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer was not woken")
            .unwrap();
        assert_eq!(key, Some("ns/a"));
    }

    #[tokio::test]
    async fn test_key_is_never_processed_concurrently() {
        let queue = Arc::new(WorkQueue::new());
        queue.add("ns/a");

        let first = queue.get().await.unwrap();
        queue.add("ns/a");

        let second = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        queue.done(&first);
        let second = tokio::time::timeout(Duration::from_secs(1), second)
            .await
            .expect("key was not redelivered")
            .unwrap();
        assert_eq!(second, Some("ns/a"));
    }

    #[tokio::test]
    async fn test_shut_down_with_drain_waits_for_in_flight() {
        let queue = Arc::new(WorkQueue::new());
        queue.add("ns/a");
        let key = queue.get().await.unwrap();

        let drain = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.shut_down_with_drain().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!drain.is_finished());
        assert!(queue.is_shutting_down());

        queue.done(&key);
        tokio::time::timeout(Duration::from_secs(1), drain)
            .await
            .expect("drain did not complete")
            .unwrap();
        assert_eq!(queue.in_flight(), 0);
    }

    #[test]
    fn test_done_for_unknown_key_is_ignored() {
        let queue = WorkQueue::new();
        queue.done(&"ns/unknown");
        assert!(queue.is_empty());
        assert_eq!(queue.in_flight(), 0);
    }

    proptest! {
        #[test]
        fn prop_each_added_key_is_delivered_once(keys in prop::collection::vec(0u8..8, 0..64)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            let queue = WorkQueue::new();
            for key in &keys {
                queue.add(*key);
            }
            queue.shut_down();

            let mut delivered = Vec::new();
            rt.block_on(async {
                while let Some(key) = queue.get().await {
                    delivered.push(key);
                    queue.done(&key);
                }
            });

            let mut expected: Vec<u8> = Vec::new();
            for key in keys {
                if !expected.contains(&key) {
                    expected.push(key);
                }
            }
            prop_assert_eq!(delivered, expected);
        }
    }
}

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

//! Work queue with delayed and rate-limited requeues.
//!
//! Delayed keys are held by a background task in a heap ordered by the time
//! they become ready, then handed to the underlying [`WorkQueue`].

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::queue::WorkQueue;
use crate::rate_limiter::RateLimiter;

/// Upper bound on how long the delaying loop sleeps with nothing to do.
const MAX_IDLE_WAIT: Duration = Duration::from_secs(10);

struct Waiting<K> {
    key: K,
    ready_at: Instant,
    /// Insertion order, breaks ties between equal ready times.
    seq: u64,
}

impl<K> PartialEq for Waiting<K> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<K> Eq for Waiting<K> {}

impl<K> PartialOrd for Waiting<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Waiting<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ready_at
            .cmp(&other.ready_at)
            .then(self.seq.cmp(&other.seq))
    }
}

/// A [`WorkQueue`] that can requeue keys after a delay chosen by a
/// [`RateLimiter`].
pub struct RateLimitingQueue<K> {
    queue: Arc<WorkQueue<K>>,
    limiter: Arc<dyn RateLimiter<K>>,
    waiting_tx: mpsc::UnboundedSender<(K, Instant)>,
    /// Taken by the delaying loop when the first delayed key arrives.
    waiting_rx: Mutex<Option<mpsc::UnboundedReceiver<(K, Instant)>>>,
    stop: CancellationToken,
}

impl<K> RateLimitingQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Creates a queue using the given rate limiter.
    ///
    /// The delaying loop is spawned by the first [`add_after`] with a
    /// non-zero delay, which must happen within a tokio runtime.
    ///
    /// [`add_after`]: RateLimitingQueue::add_after
    pub fn new(limiter: Arc<dyn RateLimiter<K>>) -> Self {
        let (waiting_tx, waiting_rx) = mpsc::unbounded_channel();

        Self {
            queue: Arc::new(WorkQueue::new()),
            limiter,
            waiting_tx,
            waiting_rx: Mutex::new(Some(waiting_rx)),
            stop: CancellationToken::new(),
        }
    }

    fn ensure_waiting_loop(&self) {
        let waiting_rx = self
            .waiting_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(waiting_rx) = waiting_rx {
            tokio::spawn(waiting_loop(
                self.queue.clone(),
                waiting_rx,
                self.stop.clone(),
            ));
        }
    }

    /// Marks a key as needing processing. See [`WorkQueue::add`].
    pub fn add(&self, key: K) {
        self.queue.add(key);
    }

    /// Waits for the next key. See [`WorkQueue::get`].
    pub async fn get(&self) -> Option<K> {
        self.queue.get().await
    }

    /// Marks a key as done processing. See [`WorkQueue::done`].
    pub fn done(&self, key: &K) {
        self.queue.done(key);
    }

    /// Adds a key once `delay` has elapsed.
    ///
    /// Does not block. If the key is already waiting, the earlier ready time
    /// wins.
    pub fn add_after(&self, key: K, delay: Duration) {
        if self.queue.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.queue.add(key);
            return;
        }

        self.ensure_waiting_loop();
        // The loop only exits after shutdown, when adds are ignored anyway.
        let _ = self.waiting_tx.send((key, Instant::now() + delay));
    }

    /// Adds a key after the delay chosen by the rate limiter, recording a
    /// failure for it.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.limiter.when(&key);
        self.add_after(key, delay);
    }

    /// Clears the failure history of a key. Does not affect whether the key
    /// is pending or in flight.
    pub fn forget(&self, key: &K) {
        self.limiter.forget(key);
    }

    /// Returns the number of failures recorded for a key.
    pub fn num_requeues(&self, key: &K) -> usize {
        self.limiter.num_requeues(key)
    }

    /// Closes the queue and stops the delaying loop. Keys still waiting for
    /// their delay are discarded.
    pub fn shut_down(&self) {
        self.queue.shut_down();
        self.stop.cancel();
    }

    /// Closes the queue and waits until every in-flight key is done.
    pub async fn shut_down_with_drain(&self) {
        self.stop.cancel();
        self.queue.shut_down_with_drain().await;
    }

    /// Returns true once the queue has been shut down.
    pub fn is_shutting_down(&self) -> bool {
        self.queue.is_shutting_down()
    }

    /// Returns the number of pending keys.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns true if no key is pending.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<K> Drop for RateLimitingQueue<K> {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl<K> fmt::Debug for RateLimitingQueue<K>
where
    K: Clone + Eq + Hash,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitingQueue")
            .field("queue", &self.queue)
            .finish()
    }
}

async fn waiting_loop<K>(
    queue: Arc<WorkQueue<K>>,
    mut waiting_rx: mpsc::UnboundedReceiver<(K, Instant)>,
    stop: CancellationToken,
) where
    K: Clone + Eq + Hash,
{
    let mut heap: BinaryHeap<Reverse<Waiting<K>>> = BinaryHeap::new();
    // Current ready time per key; heap entries that disagree are stale.
    let mut ready_at: HashMap<K, Instant> = HashMap::new();
    let mut seq: u64 = 0;

    loop {
        let now = Instant::now();
        while let Some(Reverse(entry)) = heap.peek() {
            if entry.ready_at > now {
                break;
            }
            let Some(Reverse(entry)) = heap.pop() else {
                break;
            };
            if ready_at.get(&entry.key) == Some(&entry.ready_at) {
                ready_at.remove(&entry.key);
                queue.add(entry.key);
            }
        }

        let next_wake = heap
            .peek()
            .map_or(now + MAX_IDLE_WAIT, |Reverse(entry)| entry.ready_at);

        tokio::select! {
            _ = stop.cancelled() => return,
            received = waiting_rx.recv() => {
                let Some((key, at)) = received else {
                    return;
                };
                match ready_at.get(&key) {
                    Some(existing) if *existing <= at => {}
                    _ => {
                        ready_at.insert(key.clone(), at);
                        seq = seq.wrapping_add(1);
                        heap.push(Reverse(Waiting { key, ready_at: at, seq }));
                    }
                }
            }
            _ = tokio::time::sleep_until(next_wake) => {}
        }
    }
}

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

//! informer-workqueue-controller - level-triggered reconciliation for Kubernetes objects
//!
//! This library provides the pieces of a reconciliation controller:
//! - A deduplicating work queue with delayed and rate-limited requeues
//! - Per-item and overall rate limiters
//! - An informer that keeps a keyed cache and notifies event handlers
//! - A controller that runs a worker pool with bounded retries
//! - Health checks

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod controller;
pub mod health;
pub mod informer;
pub mod kube_source;
pub mod queue;
pub mod rate_limiter;
pub mod rate_limiting_queue;
pub mod source;
pub mod store;

// Re-export commonly used types
pub use config::ControllerConfig;
pub use controller::{Controller, ControllerError, FunctionReconciler, ReconcileError, Reconciler};
pub use informer::{EventHandler, Informer, Watcher};
pub use kube_source::KubeSource;
pub use queue::WorkQueue;
pub use rate_limiter::RateLimiter;
pub use rate_limiting_queue::RateLimitingQueue;
pub use source::{ChannelSource, EventSource, SourceEvent, WatchError};
pub use store::{DeletedObject, KeyedStore, MemoryStore, ObjectKey, StoreError};

/// Semantic version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

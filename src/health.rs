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

//! Health check support.
//!
//! Serves liveness, readiness and status endpoints for running controllers:
//! - `/healthz` always answers `ok` while the process is serving,
//! - `/readyz` answers 200 once every registered controller has synced,
//! - `/statusz` reports per-controller state and queue depth as JSON.

use std::collections::HashMap;
use std::sync::Arc;

use http::header::{HeaderValue, CONTENT_TYPE};
use http::StatusCode as HttpStatusCode;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::controller::{Controller, ControllerState};
use crate::store::ObjectKey;

/// Health check status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every component is ready.
    Healthy,
    /// At least one component is not ready.
    Unhealthy,
}

/// Status of one component.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    /// Whether the component is ready to do work.
    pub ready: bool,

    /// Lifecycle state.
    pub state: ControllerState,

    /// Whether the initial cache sync has completed.
    pub synced: bool,

    /// Number of keys waiting to be processed.
    pub queue_depth: usize,
}

/// Aggregated health report.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// The overall health status.
    pub status: HealthStatus,

    /// Individual component status.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub components: HashMap<String, ComponentStatus>,
}

/// Components that report their status to the health server.
pub trait HealthChecker: Send + Sync + 'static {
    /// Returns the name of this component.
    fn name(&self) -> &str;

    /// Returns the current status.
    fn status(&self) -> ComponentStatus;
}

impl<T> HealthChecker for Controller<T>
where
    T: ObjectKey + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        Controller::name(self)
    }

    fn status(&self) -> ComponentStatus {
        ComponentStatus {
            ready: self.is_ready(),
            state: self.state(),
            synced: self.has_synced(),
            queue_depth: self.queue().len(),
        }
    }
}

/// Health check registry.
#[derive(Clone, Default)]
pub struct HealthRegistry {
    checkers: Arc<RwLock<Vec<Arc<dyn HealthChecker>>>>,
}

impl HealthRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a component.
    pub async fn register(&self, checker: Arc<dyn HealthChecker>) {
        self.checkers.write().await.push(checker);
    }

    /// Collects the status of every registered component.
    pub async fn report(&self) -> HealthReport {
        let checkers = self.checkers.read().await;
        let components: HashMap<String, ComponentStatus> = checkers
            .iter()
            .map(|checker| (checker.name().to_string(), checker.status()))
            .collect();

        let status = if components.values().all(|c| c.ready) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };

        HealthReport { status, components }
    }

    /// Returns the number of registered components.
    pub async fn len(&self) -> usize {
        self.checkers.read().await.len()
    }

    /// Returns true if there are no registered components.
    pub async fn is_empty(&self) -> bool {
        self.checkers.read().await.is_empty()
    }
}

/// Health check server.
pub struct HealthServer {
    registry: HealthRegistry,
    bind_address: String,
    bind_port: u16,
}

impl HealthServer {
    /// Creates a new health server.
    pub fn new(bind_address: String, bind_port: u16) -> Self {
        Self {
            registry: HealthRegistry::new(),
            bind_address,
            bind_port,
        }
    }

    /// Returns the health registry.
    pub fn registry(&self) -> &HealthRegistry {
        &self.registry
    }

    /// Serves health endpoints until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.bind_address, self.bind_port);
        let listener = TcpListener::bind(&addr).await?;

        tracing::info!("health server listening on {}", addr);

        loop {
            let (stream, _) = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("health server stopped");
                    return Ok(());
                }
                accepted = listener.accept() => accepted?,
            };

            let registry = self.registry.clone();
            let io = TokioIo::new(stream);

            tokio::task::spawn(async move {
                let http = hyper::server::conn::http1::Builder::new();
                let service = service_fn(move |req: Request<Incoming>| {
                    handle_request(req, registry.clone())
                });

                if let Err(e) = http.serve_connection(io, service).await {
                    tracing::debug!(error = %e, "health connection closed with error");
                }
            });
        }
    }

    /// Runs the health server in a background task.
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move { self.run(cancel).await })
    }
}

async fn handle_request(
    req: Request<Incoming>,
    registry: HealthRegistry,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    Ok(respond(req.uri().path(), &registry).await)
}

/// Builds the response for a request path.
async fn respond(path: &str, registry: &HealthRegistry) -> Response<Full<Bytes>> {
    match path {
        "/healthz" | "/livez" => response(HttpStatusCode::OK, "text/plain", "ok".to_string()),
        "/readyz" => {
            let report = registry.report().await;
            if report.status == HealthStatus::Healthy {
                response(HttpStatusCode::OK, "text/plain", "ok".to_string())
            } else {
                response(
                    HttpStatusCode::SERVICE_UNAVAILABLE,
                    "text/plain",
                    "not ready".to_string(),
                )
            }
        }
        "/statusz" => {
            let report = registry.report().await;
            let status = if report.status == HealthStatus::Healthy {
                HttpStatusCode::OK
            } else {
                HttpStatusCode::SERVICE_UNAVAILABLE
            };
            let json = serde_json::to_string(&report).unwrap_or_default();
            response(status, "application/json", json)
        }
        _ => response(HttpStatusCode::NOT_FOUND, "text/plain", "not found".to_string()),
    }
}

fn response(status: HttpStatusCode, content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

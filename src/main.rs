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

//! informer-workqueue-controller - watches pods and reconciles them
//!
//! Runs a controller over the pods of one namespace. Every pod change is
//! reduced to its `namespace/name` key and reconciled by printing the pod's
//! current cached state.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use informer_workqueue_controller::config::ControllerConfig;
use informer_workqueue_controller::controller::{
    CancellationToken, Controller, ReconcileError, Reconciler,
};
use informer_workqueue_controller::health::HealthServer;
use informer_workqueue_controller::informer::{Informer, Watcher};
use informer_workqueue_controller::kube_source::KubeSource;
use informer_workqueue_controller::store::KeyedStore;

/// Pod reconciliation controller
///
/// Watches the pods of a namespace through the apiserver, keeps them in a
/// local cache and reconciles every changed pod by its key. Failed
/// reconciliations are retried with backoff a bounded number of times.
#[derive(Parser, Debug)]
#[command(name = "informer-workqueue-controller")]
#[command(version)]
#[command(about = "Level-triggered pod controller", long_about = None)]
struct Args {
    /// Path to the kubeconfig file
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Master URL to build a client from
    #[arg(long)]
    master: Option<String>,

    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Namespace to watch
    #[arg(long)]
    namespace: Option<String>,

    /// Number of concurrent reconcile workers
    #[arg(long)]
    workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    log_json: bool,

    /// Period of full cache resyncs, 0s disables resync
    #[arg(long, value_parser = parse_duration)]
    resync_period: Option<Duration>,

    /// The address to serve health checks on
    #[arg(long)]
    healthz_bind_address: Option<String>,

    /// The port to serve health checks on
    #[arg(long)]
    healthz_port: Option<u16>,
}

fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    humantime::parse_duration(s).map_err(|e| anyhow::anyhow!("invalid duration: {}", e))
}

/// Prints the cached state of each reconciled pod.
struct PodReconciler {
    store: Arc<dyn KeyedStore<Pod>>,
}

#[async_trait]
impl Reconciler for PodReconciler {
    async fn reconcile(&self, key: &str) -> Result<(), ReconcileError> {
        println!("{}", describe(self.store.as_ref(), key)?);
        Ok(())
    }
}

/// Describes what the cache holds for `key`.
fn describe(store: &dyn KeyedStore<Pod>, key: &str) -> Result<String, ReconcileError> {
    let pod = store
        .get_by_key(key)
        .map_err(|source| ReconcileError::CacheLookup {
            key: key.to_string(),
            source,
        })?;

    Ok(match pod {
        Some(pod) => format!(
            "Sync/Add/Update for Pod {}",
            pod.metadata.name.as_deref().unwrap_or_default()
        ),
        None => format!("Pod {key} deleted"),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level, args.log_json)?;

    info!("starting informer-workqueue-controller");

    let config = load_config(args).await?;

    info!(
        "configuration: namespace={}, workers={}, resync={:?}",
        config.namespace,
        config.workers,
        config.resync()
    );

    let client = create_client(&config).await?;

    let pods: Api<Pod> = Api::namespaced(client, &config.namespace);
    let informer: Arc<Informer<Pod>> = Arc::new(
        Informer::new(Arc::new(KubeSource::new(pods))).with_resync_period(config.resync()),
    );
    let reconciler = Arc::new(PodReconciler {
        store: informer.store(),
    });

    let workers = config.workers;
    let healthz = config.healthz.clone();
    let controller = Arc::new(Controller::new("pods", config, informer, reconciler));

    let shutdown_token = CancellationToken::new();

    let health_task = if healthz.enabled {
        let server = HealthServer::new(healthz.bind_address, healthz.port);
        server.registry().register(controller.clone()).await;
        Some(server.spawn(shutdown_token.child_token()))
    } else {
        None
    };

    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown().await {
            error!("failed to listen for shutdown signals: {:#}", e);
        }
        signal_token.cancel();
    });

    if let Err(e) = controller.run(workers, shutdown_token.clone()).await {
        error!("controller failed: {:#}", e);
        shutdown_token.cancel();
        return Err(e.into());
    }

    if let Some(task) = health_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("health server failed: {:#}", e),
            Err(e) => warn!("health server task failed: {}", e),
        }
    }

    info!("informer-workqueue-controller exited successfully");
    Ok(())
}

/// Initializes logging based on the provided level and format.
fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(
            level
                .parse()
                .with_context(|| format!("invalid log level: {}", level))?,
        )
        .from_env_lossy();

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty())
            .init();
    }
    Ok(())
}

/// Loads the configuration from file and applies command-line overrides.
async fn load_config(mut args: Args) -> anyhow::Result<ControllerConfig> {
    let mut config = if let Some(config_path) = args.config.take() {
        let content = tokio::fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("failed to read config file: {:?}", config_path))?;

        serde_yaml::from_str::<ControllerConfig>(&content)
            .with_context(|| format!("failed to parse config file: {:?}", config_path))?
    } else {
        ControllerConfig::default()
    };

    apply_overrides(&mut config, args);

    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Overrides configuration values with the flags that were given.
fn apply_overrides(config: &mut ControllerConfig, args: Args) {
    if let Some(kubeconfig) = args.kubeconfig {
        config.kubeconfig = Some(kubeconfig);
    }
    if let Some(master) = args.master {
        config.master = Some(master);
    }
    if let Some(namespace) = args.namespace {
        config.namespace = namespace;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(period) = args.resync_period {
        config.resync_period = period;
    }
    if let Some(address) = args.healthz_bind_address {
        config.healthz.bind_address = address;
    }
    if let Some(port) = args.healthz_port {
        config.healthz.port = port;
    }
}

/// Creates a Kubernetes client from the configuration.
async fn create_client(config: &ControllerConfig) -> anyhow::Result<kube::Client> {
    use kube::config::{KubeConfigOptions, Kubeconfig};
    use kube::Config;

    let kube_config = if let Some(kubeconfig_path) = &config.kubeconfig {
        let kubeconfig = Kubeconfig::read_from(kubeconfig_path)
            .with_context(|| format!("failed to read kubeconfig from: {:?}", kubeconfig_path))?;
        Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .with_context(|| format!("failed to load kubeconfig from: {:?}", kubeconfig_path))?
    } else if let Some(master_url) = &config.master {
        let uri = master_url
            .parse::<http::Uri>()
            .with_context(|| format!("invalid master URL: {}", master_url))?;
        Config::new(uri)
    } else {
        Config::infer().await.context("failed to load kubeconfig")?
    };

    Ok(kube::Client::try_from(kube_config)?)
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() -> anyhow::Result<()> {
    use tokio::signal;

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .context("failed to install SIGINT handler")?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
            }
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .context("failed to install Ctrl+C handler")?;
        info!("received Ctrl+C, shutting down");
    }

    Ok(())
}

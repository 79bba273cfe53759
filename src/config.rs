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

//! Configuration structures for the controller.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors found while validating a configuration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Zero workers were requested.
    #[error("workers must be at least 1")]
    NoWorkers,

    /// The bucket refill rate is not positive.
    #[error("rate limit qps must be positive, got {0}")]
    InvalidQps(f64),

    /// The bucket holds no tokens.
    #[error("rate limit burst must be at least 1")]
    InvalidBurst,

    /// The backoff range is inverted.
    #[error("base delay {base:?} exceeds max delay {max:?}")]
    InvalidBackoff {
        /// Initial delay.
        base: Duration,
        /// Delay cap.
        max: Duration,
    },
}

/// Main configuration for the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Kubeconfig file for talking to the apiserver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,

    /// Master URL to build a client from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<String>,

    /// Namespace to watch.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Number of concurrent reconcile workers.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Number of requeues before a failing key is dropped.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Requeue rate limiting.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Period of full cache resyncs. Zero disables resync.
    #[serde(default, with = "humantime_serde")]
    pub resync_period: Duration,

    /// Maximum time to wait for the initial cache sync before starting
    /// workers anyway.
    #[serde(default = "default_cache_sync_timeout", with = "humantime_serde")]
    pub cache_sync_timeout: Duration,

    /// Time after which a shutdown still waiting on in-flight reconciles is
    /// logged as slow. Workers are never interrupted.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Health server configuration.
    #[serde(default)]
    pub healthz: HealthzConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            master: None,
            namespace: default_namespace(),
            workers: default_workers(),
            max_retries: default_max_retries(),
            rate_limit: RateLimitConfig::default(),
            resync_period: Duration::ZERO,
            cache_sync_timeout: default_cache_sync_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
            healthz: HealthzConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Checks the configuration for values the controller cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        self.rate_limit.validate()
    }

    /// Returns the resync period, or `None` if resync is disabled.
    pub fn resync(&self) -> Option<Duration> {
        (!self.resync_period.is_zero()).then_some(self.resync_period)
    }
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_workers() -> usize {
    5
}

fn default_max_retries() -> usize {
    5
}

fn default_cache_sync_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Rate limiting applied to failed keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    /// Delay after the first failure of a key.
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    /// Upper bound for the per-key delay.
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Overall requeue rate across all keys.
    #[serde(default = "default_qps")]
    pub qps: f64,

    /// Requeues allowed in a burst above `qps`.
    #[serde(default = "default_burst")]
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            qps: default_qps(),
            burst: default_burst(),
        }
    }
}

impl RateLimitConfig {
    /// Checks the rate limit settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.qps.is_nan() || self.qps <= 0.0 {
            return Err(ConfigError::InvalidQps(self.qps));
        }
        if self.burst == 0 {
            return Err(ConfigError::InvalidBurst);
        }
        if self.base_delay > self.max_delay {
            return Err(ConfigError::InvalidBackoff {
                base: self.base_delay,
                max: self.max_delay,
            });
        }
        Ok(())
    }
}

fn default_base_delay() -> Duration {
    Duration::from_millis(5)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(1000)
}

fn default_qps() -> f64 {
    10.0
}

fn default_burst() -> u32 {
    100
}

/// Health server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthzConfig {
    /// Whether to serve health endpoints.
    #[serde(default = "default_healthz_enabled")]
    pub enabled: bool,

    /// The address to serve health endpoints on.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// The port to serve health endpoints on.
    #[serde(default = "default_healthz_port")]
    pub port: u16,
}

impl Default for HealthzConfig {
    fn default() -> Self {
        Self {
            enabled: default_healthz_enabled(),
            bind_address: default_bind_address(),
            port: default_healthz_port(),
        }
    }
}

fn default_healthz_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_healthz_port() -> u16 {
    10257
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ControllerConfig::default();
        assert_eq!(config.namespace, "default");
        assert_eq!(config.workers, 5);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.rate_limit.base_delay, Duration::from_millis(5));
        assert_eq!(config.rate_limit.max_delay, Duration::from_secs(1000));
        assert_eq!(config.resync(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_basic_config() {
        let yaml = r#"
namespace: kube-system
workers: 2
resyncPeriod: 10m
rateLimit:
  baseDelay: 10ms
  qps: 5
healthz:
  port: 8080
"#;

        let config: ControllerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.namespace, "kube-system");
        assert_eq!(config.workers, 2);
        assert_eq!(config.resync(), Some(Duration::from_secs(600)));
        assert_eq!(config.rate_limit.base_delay, Duration::from_millis(10));
        assert_eq!(config.rate_limit.max_delay, Duration::from_secs(1000));
        assert_eq!(config.rate_limit.burst, 100);
        assert_eq!(config.healthz.port, 8080);
        assert!(config.healthz.enabled);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ControllerConfig {
            workers: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NoWorkers));

        config.workers = 1;
        config.rate_limit.qps = 0.0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidQps(0.0)));

        config.rate_limit.qps = 10.0;
        config.rate_limit.burst = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidBurst));

        config.rate_limit.burst = 1;
        config.rate_limit.base_delay = Duration::from_secs(10);
        config.rate_limit.max_delay = Duration::from_secs(1);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBackoff { .. })
        ));
    }
}

//! Orchestrator configuration.
//!
//! Defaults match a single-node deployment; a YAML file and environment
//! variables layer on top, with the environment winning. All durations are
//! plain seconds in the file format.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hub::staging::StagingConfig;
use crate::hub::HubConfig;
use crate::provider::cluster::ClusterConfig;
use crate::queue::QueueConfig;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable held an unusable value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// The configuration file could not be read.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file could not be parsed.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The assembled configuration is not usable.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Which providers to register at startup.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    /// Register the local container-runtime provider.
    #[serde(default)]
    pub docker: bool,
    /// Register a cluster-manager provider.
    #[serde(default)]
    pub cluster: Option<ClusterConfig>,
    /// Register the in-memory mock provider (local runs and tests).
    #[serde(default)]
    pub mock: bool,
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Address the worker channel hub listens on.
    pub bind_addr: SocketAddr,
    /// Where the artifact store keeps content.
    pub artifact_path: PathBuf,
    /// Queue limits and expiry policy.
    pub queue: QueueConfig,
    /// Providers to register.
    pub providers: ProvidersConfig,

    /// Worker heartbeat cadence, in seconds. Liveness window is 3x this.
    pub heartbeat_interval_seconds: u64,
    /// Cache-response window, in seconds.
    pub cache_response_timeout_seconds: u64,
    /// Per-artifact ack window, in seconds.
    pub artifact_ack_timeout_seconds: u64,
    /// Dispatch send window, in seconds.
    pub dispatch_send_timeout_seconds: u64,

    /// Queue processor cadence, in seconds.
    pub queue_poll_interval_seconds: u64,
    /// Auto-scaler cadence, in seconds.
    pub autoscale_interval_seconds: u64,
    /// Metrics collector cadence, in seconds.
    pub metrics_interval_seconds: u64,
    /// Shutdown grace period for in-flight jobs, in seconds.
    pub shutdown_grace_seconds: u64,

    /// Resource monitor probe cadence, in seconds.
    pub probe_interval_seconds: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7700".parse().expect("static address"),
            artifact_path: PathBuf::from("./artifacts"),
            queue: QueueConfig::default(),
            providers: ProvidersConfig {
                docker: true,
                cluster: None,
                mock: false,
            },
            heartbeat_interval_seconds: 30,
            cache_response_timeout_seconds: 5,
            artifact_ack_timeout_seconds: 30,
            dispatch_send_timeout_seconds: 10,
            queue_poll_interval_seconds: 1,
            autoscale_interval_seconds: 30,
            metrics_interval_seconds: 60,
            shutdown_grace_seconds: 30,
            probe_interval_seconds: 15,
        }
    }
}

impl OrchestratorConfig {
    /// Loads a configuration file and applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                serde_yaml::from_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `TASKFLEET_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(value) = std::env::var("TASKFLEET_BIND_ADDR") {
            self.bind_addr = value.parse().map_err(|_| ConfigError::InvalidValue {
                key: "TASKFLEET_BIND_ADDR".to_string(),
                message: format!("'{value}' is not a socket address"),
            })?;
        }
        if let Ok(value) = std::env::var("TASKFLEET_ARTIFACT_PATH") {
            self.artifact_path = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("TASKFLEET_QUEUE_MAX_SIZE") {
            self.queue.max_size = value.parse().map_err(|_| ConfigError::InvalidValue {
                key: "TASKFLEET_QUEUE_MAX_SIZE".to_string(),
                message: format!("'{value}' is not a size"),
            })?;
        }
        if let Ok(value) = std::env::var("TASKFLEET_HEARTBEAT_INTERVAL") {
            self.heartbeat_interval_seconds =
                value.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "TASKFLEET_HEARTBEAT_INTERVAL".to_string(),
                    message: format!("'{value}' is not a number of seconds"),
                })?;
        }
        Ok(())
    }

    /// Rejects configurations that cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.max_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "queue.max_size must be positive".to_string(),
            ));
        }
        for (name, value) in [
            ("heartbeat_interval_seconds", self.heartbeat_interval_seconds),
            (
                "cache_response_timeout_seconds",
                self.cache_response_timeout_seconds,
            ),
            (
                "artifact_ack_timeout_seconds",
                self.artifact_ack_timeout_seconds,
            ),
            ("queue_poll_interval_seconds", self.queue_poll_interval_seconds),
            ("autoscale_interval_seconds", self.autoscale_interval_seconds),
            ("metrics_interval_seconds", self.metrics_interval_seconds),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "{name} must be positive"
                )));
            }
        }
        if !self.providers.docker && self.providers.cluster.is_none() && !self.providers.mock {
            return Err(ConfigError::ValidationFailed(
                "at least one provider must be enabled".to_string(),
            ));
        }
        Ok(())
    }

    /// Derives the hub configuration.
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_seconds),
            dispatch_send_timeout: Duration::from_secs(self.dispatch_send_timeout_seconds),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_seconds),
            staging: StagingConfig {
                cache_response_timeout: Duration::from_secs(self.cache_response_timeout_seconds),
                artifact_ack_timeout: Duration::from_secs(self.artifact_ack_timeout_seconds),
                ..StagingConfig::default()
            },
            ..HubConfig::default()
        }
    }
}

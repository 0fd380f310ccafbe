//! Configuration structures for the edgeflow service.
//!
//! Loaded from a TOML, YAML or JSON file and overridden by `EDGEFLOW__`
//! prefixed environment variables.

use crate::pipeline::Stage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Prefix of environment variables that override file values.
pub const ENV_PREFIX: &str = "EDGEFLOW";
/// Separator between prefix and nested keys, e.g. `EDGEFLOW__SERVICE__NAME`.
pub const ENV_SEPARATOR: &str = "__";
/// Payloads the retry store holds when `retry.capacity` is not set.
pub const DEFAULT_RETRY_CAPACITY: usize = 1000;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Failed to load configuration from {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: config::ConfigError,
    },
}

/// Main application configuration.
#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct AppConfig {
    pub service: ServiceOptions,
    pub trigger: Trigger,
    /// Background publishing, for stages that emit output outside an inbound message.
    pub background: Option<BackgroundOptions>,
    pub secret_store: Option<SecretStoreOptions>,
    pub retry: Option<RetryOptions>,
    pub http: Option<HttpOptions>,
    pub pipeline: PipelineOptions,
}

#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct ServiceOptions {
    pub name: String,
}

/// Transport that feeds the pipeline.
#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Mqtt(edgeflow_mqtt::config::Trigger),
    MessageBus(edgeflow_nats::config::Trigger),
}

#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct BackgroundOptions {
    /// Queue capacity. Publishers wait when the queue is full.
    pub capacity: usize,
}

#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct SecretStoreOptions {
    /// Directory holding one JSON file per secret path.
    pub path: PathBuf,
}

#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct RetryOptions {
    pub enabled: bool,
    /// Upper bound on stored payloads. Payloads beyond it are dropped with an error log.
    #[serde(default = "default_retry_capacity")]
    pub capacity: usize,
}

fn default_retry_capacity() -> usize {
    DEFAULT_RETRY_CAPACITY
}

#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct HttpOptions {
    /// Request timeout applied to every HTTP sender.
    pub timeout_secs: u64,
}

#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct PipelineOptions {
    pub stages: Vec<Stage>,
}

impl AppConfig {
    /// Reads the file at `path`, format chosen by extension, then applies environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<AppConfig, Error> {
        let path = path.as_ref();
        config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR),
            )
            .build()
            .and_then(|config| config.try_deserialize::<AppConfig>())
            .map_err(|source| Error::Load {
                path: path.to_path_buf(),
                source,
            })
    }
}

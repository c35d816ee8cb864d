//! Node configuration loading and validation.

use crate::error::{ConfigError, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which store backend a node uses for its durable stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

/// The routing topology this node participates in (spec.md §4.3).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Topology {
    /// Peer mesh: resolve locally, else via the node registry's parent cache.
    Peer,
    /// Worker node in a hub-and-spoke central topology: unknown agents route
    /// to `central_endpoint`.
    CentralWorker { central_endpoint: String },
    /// The central hub itself: behaves like `Peer` for its own locals.
    CentralNode,
}

/// Reference to an upstream parent registry (spec.md §4.5).
#[derive(Debug, Clone, Deserialize)]
pub struct ParentConfig {
    pub endpoint: String,
    #[serde(default = "default_parent_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
}

fn default_parent_timeout_ms() -> u64 {
    5_000
}

fn default_cache_ttl_ms() -> u64 {
    300_000
}

fn default_cache_capacity() -> u64 {
    10_000
}

impl ParentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

/// Top-level node configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub node_id: String,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_base_path")]
    pub base_path: String,
    #[serde(default)]
    pub topology: Option<Topology>,
    #[serde(default)]
    pub parent: Option<ParentConfig>,
    #[serde(default)]
    pub store_backend: StoreBackend,
    #[serde(default)]
    pub sqlite_path: Option<PathBuf>,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default = "default_remote_timeout_ms")]
    pub remote_timeout_ms: u64,
    #[serde(default = "default_scheduler_interval_secs")]
    pub scheduler_interval_secs: u64,
    #[serde(default = "default_triage_expiry_secs")]
    pub triage_expiry_secs: u64,
}

fn default_bind() -> String {
    "127.0.0.1:4000".to_string()
}

fn default_base_path() -> String {
    "/flock".to_string()
}

fn default_response_timeout_ms() -> u64 {
    600_000
}

fn default_remote_timeout_ms() -> u64 {
    120_000
}

fn default_scheduler_interval_secs() -> u64 {
    5
}

fn default_triage_expiry_secs() -> u64 {
    300
}

impl NodeConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_secs)
    }

    pub fn triage_expiry(&self) -> Duration {
        Duration::from_secs(self.triage_expiry_secs)
    }

    pub fn topology(&self) -> Topology {
        self.topology.clone().unwrap_or(Topology::Peer)
    }

    /// Load configuration from an optional file, layered with `FLOCK__`
    /// environment overrides.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path.to_path_buf()).format(FileFormat::Toml));
        } else {
            builder = builder.add_source(
                File::new("flock.toml", FileFormat::Toml).required(false),
            );
        }

        builder = builder.add_source(Environment::with_prefix("FLOCK").separator("__"));

        let built = builder
            .build()
            .map_err(|error| ConfigError::Invalid(error.to_string()))?;

        let config: NodeConfig = built
            .try_deserialize()
            .map_err(|error| ConfigError::Invalid(error.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::MissingKey("node_id".into()).into());
        }
        if let Topology::CentralWorker { central_endpoint } = self.topology() {
            if central_endpoint.trim().is_empty() {
                return Err(
                    ConfigError::Invalid("central_endpoint must not be empty".into()).into(),
                );
            }
        }
        if self.store_backend == StoreBackend::Sqlite && self.sqlite_path.is_none() {
            return Err(ConfigError::MissingKey("sqlite_path".into()).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_node_id() {
        let config = NodeConfig {
            node_id: String::new(),
            bind: default_bind(),
            base_path: default_base_path(),
            topology: None,
            parent: None,
            store_backend: StoreBackend::Memory,
            sqlite_path: None,
            response_timeout_ms: default_response_timeout_ms(),
            remote_timeout_ms: default_remote_timeout_ms(),
            scheduler_interval_secs: default_scheduler_interval_secs(),
            triage_expiry_secs: default_triage_expiry_secs(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_sqlite_backend_without_path() {
        let config = NodeConfig {
            node_id: "n1".into(),
            bind: default_bind(),
            base_path: default_base_path(),
            topology: None,
            parent: None,
            store_backend: StoreBackend::Sqlite,
            sqlite_path: None,
            response_timeout_ms: default_response_timeout_ms(),
            remote_timeout_ms: default_remote_timeout_ms(),
            scheduler_interval_secs: default_scheduler_interval_secs(),
            triage_expiry_secs: default_triage_expiry_secs(),
        };
        assert!(config.validate().is_err());
    }
}

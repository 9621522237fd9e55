//! Config types, used for serializing/deserializing console configuration files

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

pub mod cluster;
pub mod defaults;

pub use cluster::{KafkaClusterConfig, SchemaRegistryConfig};
pub use defaults::ClientDefaults;

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub main_log_level: String,
    pub observability_interface: Option<String>,
    #[serde(default)]
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct KafkaConfig {
    #[serde(default)]
    pub clusters: Vec<KafkaClusterConfig>,
    #[serde(default)]
    pub client_defaults: ClientDefaults,
}

impl KafkaConfig {
    pub fn cluster(&self, cluster_key: &str) -> Option<&KafkaClusterConfig> {
        self.clusters
            .iter()
            .find(|cluster| cluster.cluster_key() == cluster_key)
    }
}

/// Tuning for the cluster registry and the clients it builds.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    #[serde(default = "default_client_construction_timeout_ms")]
    pub client_construction_timeout_ms: u64,
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

fn default_client_construction_timeout_ms() -> u64 {
    5000
}

fn default_close_timeout_ms() -> u64 {
    5000
}

fn default_drain_timeout_ms() -> u64 {
    30000
}

fn default_event_queue_capacity() -> usize {
    1000
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            client_construction_timeout_ms: default_client_construction_timeout_ms(),
            close_timeout_ms: default_close_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            event_queue_capacity: default_event_queue_capacity(),
        }
    }
}

impl RegistryConfig {
    pub fn client_construction_timeout(&self) -> Duration {
        Duration::from_millis(self.client_construction_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl Config {
    pub fn from_file(filepath: &str) -> Result<Config> {
        let file = std::fs::File::open(filepath)
            .with_context(|| format!("Couldn't open the config file {filepath}"))?;
        let config: Config = serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse config file {filepath}"))?;
        config
            .prepare(&|name| std::env::var(name).ok())
            .with_context(|| format!("Invalid config file {filepath}"))
    }

    /// Resolves `${NAME}` references and validates the result.
    pub fn prepare(mut self, lookup: &impl Fn(&str) -> Option<String>) -> Result<Config> {
        for cluster in &mut self.kafka.clusters {
            cluster.resolve_references(lookup);
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        let mut errors = vec![];
        let mut keys = HashSet::new();
        let mut ids = HashSet::new();

        for cluster in &self.kafka.clusters {
            let key = cluster.cluster_key();
            if cluster.name.is_empty() {
                errors.push("kafka cluster name must not be empty".to_owned());
            }
            if cluster.listener.is_empty() {
                errors.push(format!("kafka cluster {key}: listener must not be empty"));
            }
            if !keys.insert(key.clone()) {
                errors.push(format!("kafka cluster {key} is configured more than once"));
            }
            if let Some(id) = &cluster.id {
                if !ids.insert(id.clone()) {
                    errors.push(format!(
                        "kafka cluster {key}: id {id} is already used by another cluster"
                    ));
                }
            }
        }

        if self.registry.event_queue_capacity == 0 {
            errors.push("registry event_queue_capacity must be greater than 0".to_owned());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("Configuration errors\n{}", errors.join("\n")))
        }
    }
}

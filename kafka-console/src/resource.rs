//! Point in time views of watched kafka cluster resources, and the events that deliver them.
//!
//! Only the parts of the resource the registry derives connection details from are modelled,
//! any other fields of the resource are ignored when deserializing.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct KafkaResource {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: KafkaSpec,
    pub status: Option<KafkaStatus>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ObjectMeta {
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct KafkaSpec {
    #[serde(default)]
    pub kafka: KafkaClusterSpec,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct KafkaClusterSpec {
    #[serde(default)]
    pub listeners: Vec<ListenerSpec>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ListenerSpec {
    pub name: String,
    #[serde(default)]
    pub tls: bool,
    pub authentication: Option<ListenerAuthentication>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ListenerAuthentication {
    #[serde(rename = "type")]
    pub auth_type: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KafkaStatus {
    pub cluster_id: Option<String>,
    #[serde(default)]
    pub listeners: Vec<ListenerStatus>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListenerStatus {
    pub name: String,
    pub bootstrap_servers: Option<String>,
    #[serde(default)]
    pub addresses: Vec<ListenerAddress>,
    #[serde(default)]
    pub certificates: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ListenerAddress {
    pub host: String,
    pub port: u16,
}

impl KafkaResource {
    /// `namespace/name`, the key configured clusters are correlated by.
    pub fn key(&self) -> String {
        match &self.metadata.namespace {
            Some(namespace) if !namespace.is_empty() => {
                format!("{namespace}/{}", self.metadata.name)
            }
            _ => self.metadata.name.clone(),
        }
    }

    /// The cluster id reported by the resource status, once the cluster has one.
    pub fn cluster_id(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|status| status.cluster_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    pub fn listener_spec(&self, name: &str) -> Option<&ListenerSpec> {
        self.spec
            .kafka
            .listeners
            .iter()
            .find(|listener| listener.name == name)
    }

    pub fn listener_status(&self, name: &str) -> Option<&ListenerStatus> {
        self.status
            .as_ref()?
            .listeners
            .iter()
            .find(|listener| listener.name == name)
    }
}

impl ListenerSpec {
    pub fn auth_type(&self) -> &str {
        self.authentication
            .as_ref()
            .map(|authentication| authentication.auth_type.as_str())
            .unwrap_or("")
    }
}

impl ListenerStatus {
    /// The reported bootstrap string, or failing that the joined `host:port` addresses.
    pub fn bootstrap(&self) -> Option<String> {
        if let Some(bootstrap) = &self.bootstrap_servers {
            if !bootstrap.is_empty() {
                return Some(bootstrap.clone());
            }
        }
        if self.addresses.is_empty() {
            return None;
        }
        Some(
            self.addresses
                .iter()
                .map(|address| format!("{}:{}", address.host, address.port))
                .collect::<Vec<_>>()
                .join(","),
        )
    }

    /// PEM trust material for the listener, `None` when there is none.
    pub fn trust_certificates(&self) -> Option<String> {
        if self.certificates.is_empty() {
            return None;
        }
        let joined = self.certificates.join("\n");
        let trimmed = joined.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_owned())
        }
    }
}

/// A change to a watched resource as delivered by the resource watch.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceEvent {
    Added(KafkaResource),
    Updated {
        old: KafkaResource,
        new: KafkaResource,
    },
    Removed(KafkaResource),
}

impl ResourceEvent {
    /// The key of the resource the event is about.
    pub fn key(&self) -> String {
        match self {
            ResourceEvent::Added(resource) | ResourceEvent::Removed(resource) => resource.key(),
            ResourceEvent::Updated { new, .. } => new.key(),
        }
    }
}

/// Read-only cache of the watched resources as they were at startup.
#[derive(Debug, Clone, Default)]
pub struct ResourceStore {
    resources: HashMap<String, KafkaResource>,
}

impl ResourceStore {
    pub fn new(resources: impl IntoIterator<Item = KafkaResource>) -> Self {
        ResourceStore {
            resources: resources
                .into_iter()
                .map(|resource| (resource.key(), resource))
                .collect(),
        }
    }

    /// Loads a yaml list of resources.
    pub fn from_file(filepath: &str) -> Result<ResourceStore> {
        let file = std::fs::File::open(filepath)
            .with_context(|| format!("Couldn't open the resources file {filepath}"))?;
        let resources: Vec<KafkaResource> = serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse resources file {filepath}"))?;
        Ok(ResourceStore::new(resources))
    }

    pub fn get(&self, key: &str) -> Option<&KafkaResource> {
        self.resources.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &KafkaResource> {
        self.resources.values()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

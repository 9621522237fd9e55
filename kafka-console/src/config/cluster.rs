use crate::properties::ClientKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct KafkaClusterConfig {
    pub name: String,
    /// When set, the cluster is backed by a watched kafka resource of the same namespace and name
    /// and is only registered once that resource has been seen.
    pub namespace: Option<String>,
    /// Explicit cluster id, takes precedence over the id reported by the resource status.
    pub id: Option<String>,
    /// Name of the listener that clients connect through.
    pub listener: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub admin_properties: BTreeMap<String, String>,
    #[serde(default)]
    pub consumer_properties: BTreeMap<String, String>,
    #[serde(default)]
    pub producer_properties: BTreeMap<String, String>,
    pub schema_registry: Option<SchemaRegistryConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SchemaRegistryConfig {
    pub url: String,
}

impl KafkaClusterConfig {
    /// Key used to correlate this configuration with watched resources: `namespace/name`, or just `name`.
    pub fn cluster_key(&self) -> String {
        match &self.namespace {
            Some(namespace) => format!("{namespace}/{}", self.name),
            None => self.name.clone(),
        }
    }

    pub fn has_namespace(&self) -> bool {
        self.namespace
            .as_ref()
            .map(|namespace| !namespace.is_empty())
            .unwrap_or(false)
    }

    /// Properties overridden for a single kind of client.
    pub fn client_properties(&self, kind: ClientKind) -> &BTreeMap<String, String> {
        match kind {
            ClientKind::Admin => &self.admin_properties,
            ClientKind::Consumer => &self.consumer_properties,
            ClientKind::Producer => &self.producer_properties,
        }
    }

    /// Replaces `${NAME}` references in every property value and the schema registry url.
    pub(crate) fn resolve_references(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        for properties in [
            &mut self.properties,
            &mut self.admin_properties,
            &mut self.consumer_properties,
            &mut self.producer_properties,
        ] {
            for value in properties.values_mut() {
                *value = resolve_reference(value, lookup);
            }
        }
        if let Some(schema_registry) = &mut self.schema_registry {
            schema_registry.url = resolve_reference(&schema_registry.url, lookup);
        }
    }
}

/// A value of the form `${NAME}` is replaced by the looked up value, any other value is returned verbatim.
/// Unresolvable references are also left as is.
pub(crate) fn resolve_reference(value: &str, lookup: &impl Fn(&str) -> Option<String>) -> String {
    value
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .and_then(lookup)
        .unwrap_or_else(|| value.to_owned())
}

//! Merges the configured, resource derived and default client properties of a cluster
//! into the final property maps of a [`ConnectionContext`].
//!
//! Precedence per property, highest first:
//! 1. the cluster's override map for the kind of client
//! 2. the cluster's property map
//! 3. values derived from the listener of the cluster's resource
//! 4. environment wide defaults, see [`ClientDefaults::lookup`]
//!
//! The [`required_defaults`] are applied after all of these and can not be overridden.

use crate::client::{self, ClientFactory, SchemaRegistryClient};
use crate::config::{ClientDefaults, KafkaClusterConfig};
use crate::context::ConnectionContext;
use crate::credentials::{OAUTH_LOGIN_CALLBACK_HANDLER, OAUTHBEARER, SCRAM_SHA512};
use crate::error::RegistryError;
use crate::properties::{
    self, BOOTSTRAP_SERVERS, ClientKind, ClientProperties, PropertyMap, SASL_LOGIN_CALLBACK_HANDLER_CLASS,
    SASL_MECHANISM, SECURITY_PROTOCOL, SSL_TRUSTSTORE_CERTIFICATES, SSL_TRUSTSTORE_TYPE,
};
use crate::resource::KafkaResource;
use std::sync::Arc;
use std::time::Duration;

pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

const ADMIN_REQUIRED: &[(&str, &str)] = &[
    ("default.api.timeout.ms", "5000"),
    ("request.timeout.ms", "5000"),
];

const CONSUMER_REQUIRED: &[(&str, &str)] = &[
    ("allow.auto.create.topics", "false"),
    (
        "key.deserializer",
        "org.apache.kafka.common.serialization.ByteArrayDeserializer",
    ),
    (
        "value.deserializer",
        "org.apache.kafka.common.serialization.ByteArrayDeserializer",
    ),
    ("session.timeout.ms", "50000"),
    ("auto.offset.reset", "earliest"),
    ("default.api.timeout.ms", "5000"),
    ("apicurio.registry.headers.enabled", "true"),
];

const PRODUCER_REQUIRED: &[(&str, &str)] = &[
    (
        "key.serializer",
        "org.apache.kafka.common.serialization.StringSerializer",
    ),
    (
        "value.serializer",
        "org.apache.kafka.common.serialization.StringSerializer",
    ),
    ("acks", "all"),
    ("max.block.ms", "5000"),
    ("enable.idempotence", "false"),
    ("retries", "0"),
];

/// Properties the console relies on for every client of a kind, applied over everything else.
pub fn required_defaults(kind: ClientKind) -> &'static [(&'static str, &'static str)] {
    match kind {
        ClientKind::Admin => ADMIN_REQUIRED,
        ClientKind::Consumer => CONSUMER_REQUIRED,
        ClientKind::Producer => PRODUCER_REQUIRED,
    }
}

/// The explicitly configured id wins over the id reported by the resource.
pub fn cluster_id(cluster: &KafkaClusterConfig, resource: Option<&KafkaResource>) -> Option<String> {
    cluster
        .id
        .clone()
        .filter(|id| !id.is_empty())
        .or_else(|| resource.and_then(KafkaResource::cluster_id).map(str::to_owned))
}

/// Connection properties derived from the listener a cluster is configured to connect through.
pub fn listener_properties(listener: &str, resource: &KafkaResource) -> PropertyMap {
    let mut derived = PropertyMap::new();

    if let Some(spec) = resource.listener_spec(listener) {
        let mechanism = match spec.auth_type() {
            "oauth" => {
                derived.insert(
                    SASL_LOGIN_CALLBACK_HANDLER_CLASS.to_owned(),
                    OAUTH_LOGIN_CALLBACK_HANDLER.to_owned(),
                );
                Some(OAUTHBEARER)
            }
            "scram-sha-512" => Some(SCRAM_SHA512),
            _ => None,
        };
        let transport = if spec.tls { "SSL" } else { "PLAINTEXT" };
        let protocol = match mechanism {
            Some(mechanism) => {
                derived.insert(SASL_MECHANISM.to_owned(), mechanism.to_owned());
                format!("SASL_{transport}")
            }
            None => transport.to_owned(),
        };
        derived.insert(SECURITY_PROTOCOL.to_owned(), protocol);
    }

    if let Some(status) = resource.listener_status(listener) {
        if let Some(bootstrap) = status.bootstrap() {
            derived.insert(BOOTSTRAP_SERVERS.to_owned(), bootstrap);
        }
        if let Some(certificates) = status.trust_certificates() {
            derived.insert(SSL_TRUSTSTORE_TYPE.to_owned(), "PEM".to_owned());
            derived.insert(SSL_TRUSTSTORE_CERTIFICATES.to_owned(), certificates);
        }
    }

    derived
}

/// The final property map for one kind of client of a cluster.
pub fn merge_properties(
    kind: ClientKind,
    cluster: &KafkaClusterConfig,
    resource: Option<&KafkaResource>,
    defaults: &ClientDefaults,
    env: &dyn Fn(&str) -> Option<String>,
) -> PropertyMap {
    let mut merged: PropertyMap = defaults
        .names(kind)
        .filter_map(|name| {
            defaults
                .lookup(kind, name, &env)
                .map(|value| (name.to_owned(), value))
        })
        .collect();

    if let Some(resource) = resource {
        merged.extend(listener_properties(&cluster.listener, resource));
    }
    merged.extend(cluster.properties.clone());
    merged.extend(cluster.client_properties(kind).clone());
    merged.retain(|name, _| kind.accepts(name));

    merged.extend(
        required_defaults(kind)
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string())),
    );
    merged
}

/// Checks the merged properties of a cluster.
///
/// Returns `Err` when no client could ever be built, otherwise the diagnostic for
/// problems that only make connection attempts likely to fail.
pub fn validate(
    cluster: &KafkaClusterConfig,
    resource: Option<&KafkaResource>,
    properties: &ClientProperties,
) -> Result<Option<RegistryError>, RegistryError> {
    let cluster_key = cluster.cluster_key();

    let mut missing = String::new();
    for (kind, map) in properties.iter() {
        let required = properties::missing_required(map);
        if !required.is_empty() {
            missing.push_str(&format!(
                "; {kind} client is missing required properties: [{}]",
                required.join(", ")
            ));
        }
    }
    if !missing.is_empty() {
        return Err(RegistryError::ConfigurationInvalid {
            cluster_key,
            details: missing,
        });
    }

    let mut incomplete = String::new();
    if let Some(resource) = resource {
        if resource.listener_status(&cluster.listener).is_none() {
            incomplete.push_str(&format!(
                "; listener {} has no status in resource {}, bootstrap servers and trusted certificates could not be derived",
                cluster.listener,
                resource.key()
            ));
        }
    }
    for (kind, map) in properties.iter() {
        if properties::truststore_required(map) {
            incomplete.push_str(&format!(
                "; {kind} client uses a secure connection but no trusted certificates are configured"
            ));
        }
        if properties::requires_authentication(map) {
            if let Some(mechanism) = properties::sasl_mechanism(map) {
                incomplete.push_str(&format!(
                    "; {kind} client requires caller supplied credentials for SASL mechanism {mechanism}"
                ));
            }
        }
    }

    if incomplete.is_empty() {
        Ok(None)
    } else {
        Ok(Some(RegistryError::ConfigurationIncomplete {
            cluster_key,
            details: incomplete,
        }))
    }
}

/// A shared admin client is only built up front when nothing about the connection depends on the caller
/// and no trust material is outstanding.
pub fn establish_shared_connection(admin: &PropertyMap) -> bool {
    properties::missing_required(admin).is_empty()
        && !properties::truststore_required(admin)
        && !properties::requires_authentication(admin)
}

pub struct ConfigMerger {
    defaults: ClientDefaults,
    env: EnvLookup,
    factory: Arc<dyn ClientFactory>,
    construction_timeout: Duration,
}

impl ConfigMerger {
    pub fn new(
        defaults: ClientDefaults,
        factory: Arc<dyn ClientFactory>,
        construction_timeout: Duration,
    ) -> Self {
        ConfigMerger {
            defaults,
            env: Arc::new(|name: &str| std::env::var(name).ok()),
            factory,
            construction_timeout,
        }
    }

    /// Replaces the process environment as the source of environment wide defaults.
    pub fn with_env(mut self, env: EnvLookup) -> Self {
        self.env = env;
        self
    }

    pub fn factory(&self) -> &Arc<dyn ClientFactory> {
        &self.factory
    }

    pub fn construction_timeout(&self) -> Duration {
        self.construction_timeout
    }

    pub fn merge(
        &self,
        cluster: &KafkaClusterConfig,
        resource: Option<&KafkaResource>,
    ) -> ClientProperties {
        ClientProperties::from_fn(|kind| {
            merge_properties(kind, cluster, resource, &self.defaults, &*self.env)
        })
    }

    /// Builds the registry owned context of a cluster.
    ///
    /// Fails when the cluster has no id yet or its configuration is unusable.
    /// Failure to build the shared admin client is not fatal, the admin client is then built per request instead.
    pub async fn resolve(
        &self,
        cluster: &KafkaClusterConfig,
        resource: Option<&KafkaResource>,
    ) -> Result<ConnectionContext, RegistryError> {
        let cluster_key = cluster.cluster_key();
        let cluster_id = cluster_id(cluster, resource).ok_or_else(|| {
            RegistryError::ClusterIdUnavailable {
                cluster_key: cluster_key.clone(),
            }
        })?;

        let properties = self.merge(cluster, resource);
        for (kind, map) in properties.iter() {
            tracing::trace!(
                "{kind} client configuration for cluster {cluster_key}:\n{}",
                properties::masked(map)
            );
        }

        if let Some(incomplete) = validate(cluster, resource, &properties)? {
            tracing::warn!("{incomplete}");
        }

        let admin_properties = properties.get(ClientKind::Admin);
        let admin = if establish_shared_connection(admin_properties) {
            match client::create_with_timeout(
                &*self.factory,
                &cluster_id,
                ClientKind::Admin,
                admin_properties,
                self.construction_timeout,
            )
            .await
            {
                Ok(admin) => Some(admin),
                Err(err) => {
                    tracing::warn!(
                        "Shared admin client for cluster {cluster_key} could not be created, it will be created per request instead: {:?}",
                        anyhow::Error::from(err)
                    );
                    None
                }
            }
        } else {
            tracing::debug!(%cluster_key, %cluster_id, "admin client will be created per request");
            None
        };

        let schema_registry = cluster.schema_registry.as_ref().and_then(|config| {
            match SchemaRegistryClient::new(&config.url, self.construction_timeout) {
                Ok(client) => Some(Arc::new(client)),
                Err(err) => {
                    tracing::warn!(
                        "Schema registry for cluster {cluster_key} is unavailable: {err:?}"
                    );
                    None
                }
            }
        });

        Ok(ConnectionContext::registered(
            cluster_key,
            cluster_id,
            properties,
            admin,
            schema_registry,
        ))
    }
}

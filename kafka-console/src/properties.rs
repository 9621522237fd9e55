//! Client property maps and the handful of kafka client property names the registry reasons about.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A resolved set of kafka client properties.
/// Ordered so that logged configuration is stable between runs.
pub type PropertyMap = BTreeMap<String, String>;

pub const BOOTSTRAP_SERVERS: &str = "bootstrap.servers";
pub const SECURITY_PROTOCOL: &str = "security.protocol";
pub const SASL_MECHANISM: &str = "sasl.mechanism";
pub const SASL_JAAS_CONFIG: &str = "sasl.jaas.config";
pub const SASL_LOGIN_CALLBACK_HANDLER_CLASS: &str = "sasl.login.callback.handler.class";
pub const SASL_LOGIN_REFRESH_BUFFER_SECONDS: &str = "sasl.login.refresh.buffer.seconds";
pub const SSL_TRUSTSTORE_TYPE: &str = "ssl.truststore.type";
pub const SSL_TRUSTSTORE_CERTIFICATES: &str = "ssl.truststore.certificates";
pub const SSL_TRUSTSTORE_LOCATION: &str = "ssl.truststore.location";
pub const SSL_ENDPOINT_IDENTIFICATION_ALGORITHM: &str = "ssl.endpoint.identification.algorithm";
pub const GROUP_ID: &str = "group.id";

const COMMON_PROPERTIES: &[&str] = &[
    BOOTSTRAP_SERVERS,
    "client.id",
    "client.dns.lookup",
    "connections.max.idle.ms",
    "default.api.timeout.ms",
    "metadata.max.age.ms",
    "reconnect.backoff.ms",
    "reconnect.backoff.max.ms",
    "request.timeout.ms",
    "retry.backoff.ms",
    SECURITY_PROTOCOL,
    SASL_MECHANISM,
    SASL_JAAS_CONFIG,
    SASL_LOGIN_CALLBACK_HANDLER_CLASS,
    SASL_LOGIN_REFRESH_BUFFER_SECONDS,
    "sasl.oauthbearer.token.endpoint.url",
    SSL_TRUSTSTORE_TYPE,
    SSL_TRUSTSTORE_CERTIFICATES,
    SSL_TRUSTSTORE_LOCATION,
    "ssl.truststore.password",
    "ssl.keystore.type",
    "ssl.keystore.location",
    "ssl.keystore.password",
    "ssl.key.password",
    SSL_ENDPOINT_IDENTIFICATION_ALGORITHM,
];

const CONSUMER_PROPERTIES: &[&str] = &[
    "allow.auto.create.topics",
    "auto.offset.reset",
    "enable.auto.commit",
    "fetch.max.bytes",
    "fetch.max.wait.ms",
    "fetch.min.bytes",
    "isolation.level",
    "key.deserializer",
    "max.partition.fetch.bytes",
    "max.poll.records",
    "session.timeout.ms",
    "value.deserializer",
];

const PRODUCER_PROPERTIES: &[&str] = &[
    "acks",
    "batch.size",
    "compression.type",
    "delivery.timeout.ms",
    "enable.idempotence",
    "key.serializer",
    "linger.ms",
    "max.block.ms",
    "max.request.size",
    "retries",
    "value.serializer",
];

/// The three kinds of client built for a cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientKind {
    Admin,
    Consumer,
    Producer,
}

impl ClientKind {
    pub const ALL: [ClientKind; 3] = [ClientKind::Admin, ClientKind::Consumer, ClientKind::Producer];

    pub fn as_str(&self) -> &'static str {
        match self {
            ClientKind::Admin => "admin",
            ClientKind::Consumer => "consumer",
            ClientKind::Producer => "producer",
        }
    }

    /// Property names that are looked up in the environment wide defaults for this kind of client.
    pub fn known_properties(&self) -> impl Iterator<Item = &'static str> {
        let specific: &'static [&'static str] = match self {
            ClientKind::Admin => &[],
            ClientKind::Consumer => CONSUMER_PROPERTIES,
            ClientKind::Producer => PRODUCER_PROPERTIES,
        };
        COMMON_PROPERTIES.iter().chain(specific).copied()
    }

    /// Returns false for properties this application must never hand to this kind of client.
    pub fn accepts(&self, name: &str) -> bool {
        // The console only ever reads as an anonymous consumer
        !(*self == ClientKind::Consumer && name == GROUP_ID)
    }
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final property maps for every client kind of a single cluster.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClientProperties {
    admin: PropertyMap,
    consumer: PropertyMap,
    producer: PropertyMap,
}

impl ClientProperties {
    pub fn from_fn(mut f: impl FnMut(ClientKind) -> PropertyMap) -> Self {
        ClientProperties {
            admin: f(ClientKind::Admin),
            consumer: f(ClientKind::Consumer),
            producer: f(ClientKind::Producer),
        }
    }

    pub fn try_from_fn<E>(
        mut f: impl FnMut(ClientKind) -> Result<PropertyMap, E>,
    ) -> Result<Self, E> {
        Ok(ClientProperties {
            admin: f(ClientKind::Admin)?,
            consumer: f(ClientKind::Consumer)?,
            producer: f(ClientKind::Producer)?,
        })
    }

    pub fn get(&self, kind: ClientKind) -> &PropertyMap {
        match kind {
            ClientKind::Admin => &self.admin,
            ClientKind::Consumer => &self.consumer,
            ClientKind::Producer => &self.producer,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClientKind, &PropertyMap)> {
        ClientKind::ALL.into_iter().map(|kind| (kind, self.get(kind)))
    }
}

pub fn sasl_mechanism(properties: &PropertyMap) -> Option<&str> {
    properties.get(SASL_MECHANISM).map(String::as_str)
}

/// A SASL mechanism is configured but no login module credential is available,
/// the caller has to supply one with every request.
pub fn requires_authentication(properties: &PropertyMap) -> bool {
    properties.contains_key(SASL_MECHANISM) && !properties.contains_key(SASL_JAAS_CONFIG)
}

/// The security protocol is `SSL` or `SASL_SSL`.
pub fn tls_enabled(properties: &PropertyMap) -> bool {
    properties
        .get(SECURITY_PROTOCOL)
        .map(|protocol| protocol.ends_with("SSL"))
        .unwrap_or(false)
}

/// The connection is secured with TLS but no trust material has been supplied.
pub fn truststore_required(properties: &PropertyMap) -> bool {
    tls_enabled(properties)
        && !properties.contains_key(SSL_TRUSTSTORE_CERTIFICATES)
        && !properties.contains_key(SSL_TRUSTSTORE_LOCATION)
}

/// Properties that must be present before any client can be built from the map.
pub fn missing_required(properties: &PropertyMap) -> Vec<&'static str> {
    let mut missing = vec![];

    if !properties.contains_key(BOOTSTRAP_SERVERS) {
        missing.push(BOOTSTRAP_SERVERS);
    }

    if properties.contains_key(SASL_JAAS_CONFIG) && !properties.contains_key(SASL_MECHANISM) {
        missing.push(SASL_MECHANISM);
    }

    missing
}

/// Renders the map for trace logging with any quoted secrets in the login module configuration masked.
pub fn masked(properties: &PropertyMap) -> String {
    properties
        .iter()
        .map(|(name, value)| {
            if name == SASL_JAAS_CONFIG {
                format!("\t{name} = {}", mask_quoted(value))
            } else {
                format!("\t{name} = {value}")
            }
        })
        .join("\n")
}

fn mask_quoted(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    let mut parts = value.split('"');
    if let Some(first) = parts.next() {
        result.push_str(first);
    }
    let rest: Vec<&str> = parts.collect();
    // an unterminated quote is left as is
    let complete = rest.len() - rest.len() % 2;
    for pair in rest[..complete].chunks(2) {
        result.push_str("\"******\"");
        result.push_str(pair[1]);
    }
    if let Some(unterminated) = rest.get(complete) {
        result.push('"');
        result.push_str(unterminated);
    }
    result
}

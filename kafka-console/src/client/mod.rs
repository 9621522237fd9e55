//! The seam between the registry and the client library that actually talks to the brokers.

use crate::error::RegistryError;
use crate::properties::{ClientKind, PropertyMap};
use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub mod broker;
pub mod schema_registry;
pub mod tls;

pub use broker::BrokerClientFactory;
pub use schema_registry::SchemaRegistryClient;

/// A client built from a property map.
/// Whoever created the handle is responsible for closing it exactly once.
#[async_trait]
pub trait ClientHandle: Send + Sync + fmt::Debug {
    fn kind(&self) -> ClientKind;

    /// Releases every resource held by the client.
    async fn close(&self) -> Result<()>;
}

/// Builds clients from their final property maps.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// May perform network and DNS work, callers are expected to bound it with a timeout.
    /// Dropping the returned future must release anything acquired so far.
    async fn create(
        &self,
        kind: ClientKind,
        properties: &PropertyMap,
    ) -> Result<Arc<dyn ClientHandle>>;
}

/// Builds a client, abandoning construction once `timeout` has elapsed.
pub async fn create_with_timeout(
    factory: &dyn ClientFactory,
    cluster_id: &str,
    kind: ClientKind,
    properties: &PropertyMap,
    timeout: Duration,
) -> Result<Arc<dyn ClientHandle>, RegistryError> {
    match tokio::time::timeout(timeout, factory.create(kind, properties)).await {
        Ok(Ok(handle)) => Ok(handle),
        Ok(Err(source)) => Err(RegistryError::HandleConstructionFailed {
            cluster_id: cluster_id.to_owned(),
            kind,
            source,
        }),
        Err(_) => Err(RegistryError::HandleConstructionTimeout {
            cluster_id: cluster_id.to_owned(),
            kind,
            timeout,
        }),
    }
}

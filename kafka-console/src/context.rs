use crate::client::{ClientHandle, SchemaRegistryClient};
use crate::properties::{self, ClientKind, ClientProperties, PropertyMap};
use anyhow::Result;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Who is responsible for closing the handles held by a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextScope {
    /// Lives in the cluster registry, closed when it is replaced or removed or at shutdown.
    Registry,
    /// Built for a single request, closed by that request's disposer.
    Request,
}

/// The resolved connection details of one cluster and the handles built from them.
///
/// Contexts are never modified after construction, a change to the cluster produces a new context.
pub struct ConnectionContext {
    cluster_key: String,
    cluster_id: String,
    properties: Arc<ClientProperties>,
    admin: Option<Arc<dyn ClientHandle>>,
    schema_registry: Option<Arc<SchemaRegistryClient>>,
    scope: ContextScope,
    closed: AtomicBool,
}

impl ConnectionContext {
    pub fn registered(
        cluster_key: String,
        cluster_id: String,
        properties: ClientProperties,
        admin: Option<Arc<dyn ClientHandle>>,
        schema_registry: Option<Arc<SchemaRegistryClient>>,
    ) -> Self {
        ConnectionContext {
            cluster_key,
            cluster_id,
            properties: Arc::new(properties),
            admin,
            schema_registry,
            scope: ContextScope::Registry,
            closed: AtomicBool::new(false),
        }
    }

    /// A request scoped context for the same cluster, holding caller authenticated properties
    /// and an admin handle built from them.
    pub fn for_request(&self, properties: ClientProperties, admin: Arc<dyn ClientHandle>) -> Self {
        ConnectionContext {
            cluster_key: self.cluster_key.clone(),
            cluster_id: self.cluster_id.clone(),
            properties: Arc::new(properties),
            admin: Some(admin),
            schema_registry: self.schema_registry.clone(),
            scope: ContextScope::Request,
            closed: AtomicBool::new(false),
        }
    }

    pub fn cluster_key(&self) -> &str {
        &self.cluster_key
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn scope(&self) -> ContextScope {
        self.scope
    }

    pub fn properties(&self, kind: ClientKind) -> &PropertyMap {
        self.properties.get(kind)
    }

    pub fn client_properties(&self) -> &ClientProperties {
        &self.properties
    }

    pub fn admin(&self) -> Option<&Arc<dyn ClientHandle>> {
        self.admin.as_ref()
    }

    pub fn schema_registry(&self) -> Option<&Arc<SchemaRegistryClient>> {
        self.schema_registry.as_ref()
    }

    /// True when clients of this kind can only be built with credentials supplied by the caller.
    pub fn requires_authentication(&self, kind: ClientKind) -> bool {
        properties::requires_authentication(self.properties(kind))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the admin handle held by this context.
    /// Only the first call does anything.
    ///
    /// The schema registry client is shared with request scoped contexts derived from this one
    /// and is released when the last of them is dropped.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match &self.admin {
            Some(admin) => admin.close().await,
            None => Ok(()),
        }
    }
}

// Property maps may carry credentials so they are left out
impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("cluster_key", &self.cluster_key)
            .field("cluster_id", &self.cluster_id)
            .field("scope", &self.scope)
            .field("admin", &self.admin)
            .field(
                "schema_registry",
                &self.schema_registry.as_ref().map(|client| client.base_url().as_str()),
            )
            .finish()
    }
}

//! Per request access to a cluster.
//!
//! A request resolves the context of its target cluster and receives a [`Disposer`] with it.
//! Contexts owned by the registry come with a disposer that does nothing.
//! When the cluster has no shared admin client the request gets its own, built with the caller's credentials,
//! and the disposer closes it.
//! Consumers and producers are never shared, every one of them comes with its own disposer.

use crate::client::{self, ClientFactory, ClientHandle};
use crate::context::{ConnectionContext, ContextScope};
use crate::credentials;
use crate::error::RegistryError;
use crate::properties::{ClientKind, ClientProperties};
use crate::registry::ClusterRegistry;
use metrics::gauge;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const REQUEST_SCOPED_CLIENTS: &str = "kafka_console_request_scoped_clients";

enum Release {
    Nothing,
    Context(Arc<ConnectionContext>),
    Handle(Arc<dyn ClientHandle>),
}

impl Release {
    async fn run(self) {
        let result = match &self {
            Release::Nothing => return,
            Release::Context(context) => context.close().await,
            Release::Handle(handle) => handle.close().await,
        };
        gauge!(REQUEST_SCOPED_CLIENTS).decrement(1.0);
        if let Err(err) = result {
            tracing::warn!("Failed to close request scoped kafka client: {err:?}");
        }
    }
}

/// Releases whatever a request acquired. Only the first call to [`Disposer::dispose`] has any effect.
///
/// A disposer dropped without being disposed, for example because the request was cancelled,
/// releases in the background on the current tokio runtime.
pub struct Disposer {
    release: std::sync::Mutex<Release>,
    disposed: AtomicBool,
}

impl Disposer {
    fn new(release: Release) -> Self {
        if !matches!(release, Release::Nothing) {
            gauge!(REQUEST_SCOPED_CLIENTS).increment(1.0);
        }
        Disposer {
            release: std::sync::Mutex::new(release),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn noop() -> Self {
        Disposer::new(Release::Nothing)
    }

    fn take(&self) -> Release {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Release::Nothing;
        }
        match self.release.lock() {
            Ok(mut release) => std::mem::replace(&mut *release, Release::Nothing),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), Release::Nothing),
        }
    }

    pub async fn dispose(&self) {
        self.take().run().await;
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl Drop for Disposer {
    fn drop(&mut self) {
        let release = self.take();
        if matches!(release, Release::Nothing) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(release.run());
            }
            Err(_) => {
                tracing::error!("Request scoped kafka client dropped outside of a runtime, it could not be closed");
            }
        }
    }
}

/// A consumer or producer built for one request.
pub struct ScopedClient {
    handle: Arc<dyn ClientHandle>,
    disposer: Disposer,
}

impl ScopedClient {
    pub fn handle(&self) -> &Arc<dyn ClientHandle> {
        &self.handle
    }

    pub async fn dispose(&self) {
        self.disposer.dispose().await
    }
}

/// The context a request works with and everything needed to release it.
pub struct ResolvedContext {
    context: Arc<ConnectionContext>,
    disposer: Disposer,
    authorization: Option<String>,
    factory: Arc<dyn ClientFactory>,
    construction_timeout: Duration,
}

impl ResolvedContext {
    pub fn context(&self) -> &Arc<ConnectionContext> {
        &self.context
    }

    pub fn admin(&self) -> Option<&Arc<dyn ClientHandle>> {
        self.context.admin()
    }

    pub fn is_request_scoped(&self) -> bool {
        self.context.scope() == ContextScope::Request
    }

    pub fn disposer(&self) -> &Disposer {
        &self.disposer
    }

    pub fn into_parts(self) -> (Arc<ConnectionContext>, Disposer) {
        (self.context, self.disposer)
    }

    pub async fn dispose(&self) {
        self.disposer.dispose().await
    }

    pub async fn consumer(&self) -> Result<ScopedClient, RegistryError> {
        self.client(ClientKind::Consumer).await
    }

    pub async fn producer(&self) -> Result<ScopedClient, RegistryError> {
        self.client(ClientKind::Producer).await
    }

    async fn client(&self, kind: ClientKind) -> Result<ScopedClient, RegistryError> {
        let properties = credentials::authenticate(
            self.context.properties(kind),
            self.authorization.as_deref(),
        )?;
        let handle = client::create_with_timeout(
            &*self.factory,
            self.context.cluster_id(),
            kind,
            &properties,
            self.construction_timeout,
        )
        .await?;
        Ok(ScopedClient {
            handle: handle.clone(),
            disposer: Disposer::new(Release::Handle(handle)),
        })
    }
}

pub struct RequestResolver {
    registry: Arc<ClusterRegistry>,
    factory: Arc<dyn ClientFactory>,
    construction_timeout: Duration,
}

impl RequestResolver {
    pub fn new(
        registry: Arc<ClusterRegistry>,
        factory: Arc<dyn ClientFactory>,
        construction_timeout: Duration,
    ) -> Self {
        RequestResolver {
            registry,
            factory,
            construction_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<ClusterRegistry> {
        &self.registry
    }

    /// Resolves the context for a request to `cluster_id`.
    ///
    /// `authorization` is the raw `Authorization` header of the request.
    /// It is only used when the cluster requires caller supplied credentials.
    /// Dropping the returned future while the admin client is being built abandons and releases it.
    pub async fn resolve(
        &self,
        cluster_id: &str,
        authorization: Option<&str>,
    ) -> Result<ResolvedContext, RegistryError> {
        let context =
            self.registry
                .get(cluster_id)
                .ok_or_else(|| RegistryError::ClusterNotFound {
                    cluster_id: cluster_id.to_owned(),
                })?;

        if context.admin().is_some() {
            return Ok(self.resolved(context, Disposer::noop(), authorization));
        }

        let properties = ClientProperties::try_from_fn(|kind| {
            credentials::authenticate(context.properties(kind), authorization)
        })?;
        let admin = client::create_with_timeout(
            &*self.factory,
            cluster_id,
            ClientKind::Admin,
            properties.get(ClientKind::Admin),
            self.construction_timeout,
        )
        .await?;
        tracing::debug!(cluster_id, "created request scoped admin client");

        let scoped = Arc::new(context.for_request(properties, admin));
        let disposer = Disposer::new(Release::Context(scoped.clone()));
        Ok(self.resolved(scoped, disposer, authorization))
    }

    /// Runs `f` with the resolved context of `cluster_id` and disposes of it once `f` completes,
    /// whatever its result.
    pub async fn with_context<T, E, F, Fut>(
        &self,
        cluster_id: &str,
        authorization: Option<&str>,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Arc<ResolvedContext>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<RegistryError>,
    {
        let resolved = Arc::new(self.resolve(cluster_id, authorization).await?);
        let result = f(resolved.clone()).await;
        resolved.dispose().await;
        result
    }

    fn resolved(
        &self,
        context: Arc<ConnectionContext>,
        disposer: Disposer,
        authorization: Option<&str>,
    ) -> ResolvedContext {
        ResolvedContext {
            context,
            disposer,
            authorization: authorization.map(str::to_owned),
            factory: self.factory.clone(),
            construction_timeout: self.construction_timeout,
        }
    }
}

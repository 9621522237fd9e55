//! The process wide map of cluster id to [`ConnectionContext`] and the task that maintains it.
//!
//! Requests read the [`ClusterRegistry`] concurrently.
//! All changes are made by a single [`RegistryOwner`] task that receives resource events through
//! the mailbox of a [`RegistryHandle`], so events are applied one at a time in the order they arrive.

use crate::config::{KafkaClusterConfig, RegistryConfig};
use crate::context::ConnectionContext;
use crate::error::RegistryError;
use crate::merger::{self, ConfigMerger};
use crate::outcome::Outcome;
use crate::resource::{KafkaResource, ResourceEvent, ResourceStore};
use anyhow::{Result, anyhow};
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::join_all;
use metrics::{counter, gauge};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

const REGISTERED_CLUSTERS: &str = "kafka_console_registered_clusters";
const CONTEXT_REPLACEMENTS: &str = "kafka_console_context_replacements";

/// How often a retired context still in use by a request is checked for release.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub type ShutdownReport = Vec<(String, Outcome<()>)>;

pub struct ClusterRegistry {
    contexts: DashMap<String, Arc<ConnectionContext>>,
    /// Retired contexts waiting for requests to release them.
    draining: Arc<Mutex<Vec<Arc<ConnectionContext>>>>,
    close_timeout: Duration,
    drain_timeout: Duration,
}

impl ClusterRegistry {
    pub fn new(config: &RegistryConfig) -> Self {
        ClusterRegistry {
            contexts: DashMap::new(),
            draining: Default::default(),
            close_timeout: config.close_timeout(),
            drain_timeout: config.drain_timeout(),
        }
    }

    pub fn get(&self, cluster_id: &str) -> Option<Arc<ConnectionContext>> {
        self.contexts
            .get(cluster_id)
            .map(|context| context.value().clone())
    }

    /// Registered cluster ids in sorted order.
    pub fn cluster_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .contexts
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Makes the context visible to readers and returns the context it replaced.
    pub(crate) fn install(&self, context: ConnectionContext) -> Option<Arc<ConnectionContext>> {
        let previous = self
            .contexts
            .insert(context.cluster_id().to_owned(), Arc::new(context));
        gauge!(REGISTERED_CLUSTERS).set(self.contexts.len() as f64);
        previous
    }

    fn remove(&self, cluster_id: &str) -> Option<Arc<ConnectionContext>> {
        let removed = self.contexts.remove(cluster_id).map(|(_, context)| context);
        gauge!(REGISTERED_CLUSTERS).set(self.contexts.len() as f64);
        removed
    }

    /// Closes a context that is no longer reachable from the registry.
    ///
    /// Requests that looked the context up before it was replaced may still be using its admin client,
    /// in that case closing is left to a background task that waits for them to finish,
    /// up to the drain timeout.
    async fn retire(&self, context: Arc<ConnectionContext>) {
        if Arc::strong_count(&context) == 1 {
            close_context(&context, self.close_timeout).await;
            return;
        }

        let close_timeout = self.close_timeout;
        let drain_timeout = self.drain_timeout;
        let deadline = Instant::now() + drain_timeout;
        tracing::debug!(
            cluster_id = context.cluster_id(),
            "retired context is still in use, closing it once released"
        );
        let weak = Arc::downgrade(&context);
        lock(&self.draining).push(context);
        let draining = self.draining.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(DRAIN_POLL_INTERVAL);
            loop {
                interval.tick().await;
                // dropped by shutdown with no request left holding it
                let Some(context) = weak.upgrade() else {
                    return;
                };
                // held by the draining list and by this task
                let released = Arc::strong_count(&context) <= 2;
                if !released && Instant::now() < deadline {
                    continue;
                }
                if !released {
                    tracing::warn!(
                        "Closing context of cluster {} while it is still in use, requests did not release it within {:?}",
                        context.cluster_id(),
                        drain_timeout
                    );
                }
                lock(&draining).retain(|retired| !Arc::ptr_eq(retired, &context));
                close_context(&context, close_timeout).await;
                return;
            }
        });
    }

    fn take_draining(&self) -> Vec<Arc<ConnectionContext>> {
        std::mem::take(&mut *lock(&self.draining))
    }

    /// Removes and closes every context in parallel, including retired contexts still draining.
    /// Failures are logged and reported, a close that does not complete within the close timeout is abandoned.
    pub async fn shutdown(&self) -> ShutdownReport {
        let ids = self.cluster_ids();
        let mut contexts: Vec<Arc<ConnectionContext>> =
            ids.iter().filter_map(|id| self.remove(id)).collect();
        contexts.extend(self.take_draining());

        let close_timeout = self.close_timeout;
        let closes = contexts.iter().map(|context| async move {
            let outcome = close_context(context, close_timeout).await;
            (context.cluster_id().to_owned(), outcome)
        });
        let report = join_all(closes).await;

        let failures = report.iter().filter(|(_, outcome)| outcome.is_failure()).count();
        tracing::info!(
            "Closed {} kafka cluster connections, {failures} failed",
            report.len()
        );
        report
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn close_context(context: &ConnectionContext, close_timeout: Duration) -> Outcome<()> {
    let outcome = match tokio::time::timeout(close_timeout, context.close()).await {
        Ok(result) => Outcome::from(result),
        Err(_) => Outcome::Failure(anyhow!(
            "close did not complete within {close_timeout:?}"
        )),
    };
    if let Some(err) = outcome.failure() {
        tracing::warn!(
            "Failed to close connection to cluster {}: {err:?}",
            context.cluster_id()
        );
    }
    outcome
}

enum Command {
    Event(ResourceEvent),
    Shutdown(oneshot::Sender<ShutdownReport>),
}

/// Sends resource events to the registry owner task.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<Command>,
}

impl RegistryHandle {
    /// Queues an event, waiting while the mailbox is full.
    pub async fn send(&self, event: ResourceEvent) -> Result<()> {
        self.tx
            .send(Command::Event(event))
            .await
            .map_err(|_| anyhow!("The registry owner task has stopped"))
    }

    /// Processes every event queued before this call, then closes all registered contexts.
    /// The owner task stops afterwards.
    pub async fn shutdown(&self) -> Result<ShutdownReport> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(Command::Shutdown(response_tx))
            .await
            .map_err(|_| anyhow!("The registry owner task has stopped"))?;
        Ok(response_rx.await?)
    }
}

/// The only writer of the [`ClusterRegistry`].
pub struct RegistryOwner {
    registry: Arc<ClusterRegistry>,
    merger: ConfigMerger,
    clusters: HashMap<String, KafkaClusterConfig>,
    /// cluster key -> registered cluster id
    registered: HashMap<String, String>,
    /// registered cluster id -> cluster key
    owners: HashMap<String, String>,
}

impl RegistryOwner {
    pub fn new(
        registry: Arc<ClusterRegistry>,
        merger: ConfigMerger,
        clusters: Vec<KafkaClusterConfig>,
    ) -> Self {
        RegistryOwner {
            registry,
            merger,
            clusters: clusters
                .into_iter()
                .map(|cluster| (cluster.cluster_key(), cluster))
                .collect(),
            registered: HashMap::new(),
            owners: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ClusterRegistry> {
        &self.registry
    }

    /// Registers every configured cluster that can be registered now.
    ///
    /// Clusters with a cached resource are registered from it.
    /// Clusters that depend on a resource that has not been seen yet wait for its added event.
    pub async fn initialize(&mut self, resources: &ResourceStore) {
        let mut keys: Vec<String> = self.clusters.keys().cloned().collect();
        keys.sort();

        for key in keys {
            let resource = resources.get(&key);
            let depends_on_resource = self
                .clusters
                .get(&key)
                .map(KafkaClusterConfig::has_namespace)
                .unwrap_or(false);
            if resource.is_none() && depends_on_resource {
                tracing::info!("Kafka cluster {key} is waiting for its resource to be discovered");
                continue;
            }
            let result = self.register(&key, resource).await;
            report(&key, result);
        }

        tracing::info!(
            "Registered {} of {} configured kafka clusters",
            self.registry.len(),
            self.clusters.len()
        );
    }

    pub async fn on_resource_added(&mut self, resource: &KafkaResource) {
        let key = resource.key();
        let result = self.register(&key, Some(resource)).await;
        report(&key, result);
    }

    pub async fn on_resource_updated(&mut self, _old: &KafkaResource, new: &KafkaResource) {
        let key = new.key();
        let result = self.register(&key, Some(new)).await;
        report(&key, result);
    }

    pub async fn on_resource_removed(&mut self, resource: &KafkaResource) {
        let key = resource.key();
        let cluster_id = self.registered.remove(&key).or_else(|| {
            // fall back to the id the resource resolves to, as long as this key registered it
            let cluster = self.clusters.get(&key)?;
            merger::cluster_id(cluster, Some(resource))
                .filter(|id| self.owners.get(id) == Some(&key))
        });

        let Some(cluster_id) = cluster_id else {
            tracing::info!("Kafka cluster {key} is not registered, nothing to remove");
            return;
        };

        self.owners.remove(&cluster_id);
        match self.registry.remove(&cluster_id) {
            Some(context) => {
                tracing::info!("Removed kafka cluster {key} with id {cluster_id}");
                self.registry.retire(context).await;
            }
            None => {
                tracing::info!("Kafka cluster {key} is not registered, nothing to remove");
            }
        }
    }

    /// Applies one event. A panic while doing so is logged and does not stop the owner task.
    pub async fn handle_event(&mut self, event: ResourceEvent) {
        let key = event.key();
        let applied = AssertUnwindSafe(async {
            match &event {
                ResourceEvent::Added(resource) => self.on_resource_added(resource).await,
                ResourceEvent::Updated { old, new } => self.on_resource_updated(old, new).await,
                ResourceEvent::Removed(resource) => self.on_resource_removed(resource).await,
            }
        })
        .catch_unwind()
        .await;

        if let Err(panic) = applied {
            let message = panic
                .downcast_ref::<&str>()
                .map(|message| message.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_default();
            tracing::error!("Processing event for kafka resource {key} panicked: {message}");
        }
    }

    /// Runs the owner on its own task, returning the handle events are sent through.
    pub fn spawn(self, event_queue_capacity: usize) -> RegistryHandle {
        let (tx, rx) = mpsc::channel(event_queue_capacity);
        tokio::spawn(self.run(rx));
        RegistryHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Event(event) => self.handle_event(event).await,
                Command::Shutdown(response_tx) => {
                    let report = self.registry.shutdown().await;
                    response_tx.send(report).ok();
                    return;
                }
            }
        }

        // every handle was dropped without a shutdown
        tracing::debug!("registry owner task stopped");
    }

    async fn register(
        &mut self,
        cluster_key: &str,
        resource: Option<&KafkaResource>,
    ) -> Result<(), RegistryError> {
        let Some(cluster) = self.clusters.get(cluster_key) else {
            tracing::debug!("No kafka cluster is configured for resource {cluster_key}");
            return Ok(());
        };

        let cluster_id =
            merger::cluster_id(cluster, resource).ok_or_else(|| RegistryError::ClusterIdUnavailable {
                cluster_key: cluster_key.to_owned(),
            })?;
        if let Some(existing_key) = self.owners.get(&cluster_id) {
            if existing_key != cluster_key {
                return Err(RegistryError::DuplicateClusterIdentifier {
                    cluster_id,
                    cluster_key: cluster_key.to_owned(),
                    existing_key: existing_key.clone(),
                });
            }
        }

        let context = self.merger.resolve(cluster, resource).await?;
        let has_shared_admin = context.admin().is_some();

        let previous_id = self
            .registered
            .insert(cluster_key.to_owned(), cluster_id.clone());
        self.owners
            .insert(cluster_id.clone(), cluster_key.to_owned());

        match self.registry.install(context) {
            Some(replaced) => {
                counter!(CONTEXT_REPLACEMENTS).increment(1);
                tracing::info!("Replaced kafka cluster {cluster_key} with id {cluster_id}");
                self.registry.retire(replaced).await;
            }
            None => {
                tracing::info!(
                    shared_admin = has_shared_admin,
                    "Registered kafka cluster {cluster_key} with id {cluster_id}"
                );
            }
        }

        // the cluster now has a different id, drop the entry under its old one
        if let Some(previous_id) = previous_id.filter(|previous_id| *previous_id != cluster_id) {
            self.owners.remove(&previous_id);
            if let Some(stale) = self.registry.remove(&previous_id) {
                tracing::info!(
                    "Kafka cluster {cluster_key} changed id from {previous_id} to {cluster_id}"
                );
                self.registry.retire(stale).await;
            }
        }

        Ok(())
    }
}

fn report(cluster_key: &str, result: Result<(), RegistryError>) {
    let Err(err) = result else {
        return;
    };
    match err {
        RegistryError::ConfigurationInvalid { .. } => tracing::error!("{err}"),
        RegistryError::ClusterIdUnavailable { .. } => tracing::info!("{err}"),
        RegistryError::DuplicateClusterIdentifier { .. } => tracing::warn!("{err}"),
        err => tracing::warn!(
            "Failed to register kafka cluster {cluster_key}: {:?}",
            anyhow::Error::from(err)
        ),
    }
}

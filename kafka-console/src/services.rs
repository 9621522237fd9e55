use crate::client::ClientFactory;
use crate::config::Config;
use crate::merger::ConfigMerger;
use crate::registry::{ClusterRegistry, RegistryHandle, RegistryOwner, ShutdownReport};
use crate::resolver::RequestResolver;
use crate::resource::ResourceStore;
use anyhow::Result;
use std::sync::Arc;

/// Everything a request handling layer needs, wired together from the configuration.
///
/// `events` is where the resource watch delivers its events.
#[derive(Clone)]
pub struct Services {
    pub registry: Arc<ClusterRegistry>,
    pub resolver: Arc<RequestResolver>,
    pub events: RegistryHandle,
}

impl Services {
    /// Populates the registry from the configuration and cached resources,
    /// then starts the registry owner task.
    pub async fn start(
        config: &Config,
        resources: &ResourceStore,
        factory: Arc<dyn ClientFactory>,
    ) -> Services {
        let merger = ConfigMerger::new(
            config.kafka.client_defaults.clone(),
            factory,
            config.registry.client_construction_timeout(),
        );
        Services::start_with(config, resources, merger).await
    }

    /// As [`Services::start`], with the merger supplied by the caller.
    /// Requests build their clients with the merger's factory.
    pub async fn start_with(
        config: &Config,
        resources: &ResourceStore,
        merger: ConfigMerger,
    ) -> Services {
        let registry = Arc::new(ClusterRegistry::new(&config.registry));
        let factory = merger.factory().clone();
        let construction_timeout = merger.construction_timeout();
        let mut owner = RegistryOwner::new(registry.clone(), merger, config.kafka.clusters.clone());
        owner.initialize(resources).await;
        let events = owner.spawn(config.registry.event_queue_capacity);

        Services {
            resolver: Arc::new(RequestResolver::new(
                registry.clone(),
                factory,
                construction_timeout,
            )),
            registry,
            events,
        }
    }

    /// Stops the registry owner task after it has applied every queued event,
    /// closing every registered context.
    pub async fn shutdown(&self) -> Result<ShutdownReport> {
        self.events.shutdown().await
    }
}

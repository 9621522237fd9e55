use anyhow::{Result, anyhow};
use async_trait::async_trait;
use kafka_console::client::{ClientFactory, ClientHandle};
use kafka_console::config::{Config, KafkaClusterConfig, KafkaConfig};
use kafka_console::merger::ConfigMerger;
use kafka_console::properties::{BOOTSTRAP_SERVERS, ClientKind, PropertyMap};
use kafka_console::resource::{
    KafkaClusterSpec, KafkaResource, KafkaSpec, KafkaStatus, ListenerAuthentication, ListenerSpec,
    ListenerStatus, ObjectMeta, ResourceStore,
};
use kafka_console::services::Services;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type CloseHook = Arc<dyn Fn() -> Option<String> + Send + Sync>;

pub struct RecordedHandle {
    pub id: usize,
    pub kind: ClientKind,
    pub properties: PropertyMap,
    closes: AtomicUsize,
    hook: Option<CloseHook>,
    observed_on_close: Mutex<Option<String>>,
}

impl RecordedHandle {
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// What the close hook returned when this handle was first closed.
    pub fn observed_on_close(&self) -> Option<String> {
        self.observed_on_close.lock().unwrap().clone()
    }
}

impl fmt::Debug for RecordedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordedHandle({})", self.id)
    }
}

#[async_trait]
impl ClientHandle for RecordedHandle {
    fn kind(&self) -> ClientKind {
        self.kind
    }

    async fn close(&self) -> Result<()> {
        if self.closes.fetch_add(1, Ordering::SeqCst) == 0 {
            if let Some(hook) = &self.hook {
                *self.observed_on_close.lock().unwrap() = hook();
            }
        }
        Ok(())
    }
}

/// A [`ClientFactory`] that records every handle it creates.
#[derive(Default)]
pub struct RecordingFactory {
    created: Mutex<Vec<Arc<RecordedHandle>>>,
    started: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    fail: Mutex<bool>,
    panic_on: Mutex<Option<String>>,
    hook: Mutex<Option<CloseHook>>,
}

impl RecordingFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingFactory::default())
    }

    pub fn created(&self) -> Vec<Arc<RecordedHandle>> {
        self.created.lock().unwrap().clone()
    }

    pub fn created_of(&self, kind: ClientKind) -> Vec<Arc<RecordedHandle>> {
        self.created()
            .into_iter()
            .filter(|handle| handle.kind == kind)
            .collect()
    }

    /// Number of `create` calls, including those that never completed.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    /// Makes `create` panic for clients bootstrapping from `bootstrap_servers`.
    pub fn set_panic_on(&self, bootstrap_servers: &str) {
        *self.panic_on.lock().unwrap() = Some(bootstrap_servers.to_owned());
    }

    /// Called by every handle created afterwards when it is first closed.
    pub fn set_close_hook(&self, hook: impl Fn() -> Option<String> + Send + Sync + 'static) {
        *self.hook.lock().unwrap() = Some(Arc::new(hook));
    }
}

#[async_trait]
impl ClientFactory for RecordingFactory {
    async fn create(
        &self,
        kind: ClientKind,
        properties: &PropertyMap,
    ) -> Result<Arc<dyn ClientHandle>> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let panics = self.panic_on.lock().unwrap().clone();
        if panics.is_some() && panics.as_ref() == properties.get(BOOTSTRAP_SERVERS) {
            panic!("malformed cluster {panics:?}");
        }
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if *self.fail.lock().unwrap() {
            return Err(anyhow!("broker unreachable"));
        }

        let mut created = self.created.lock().unwrap();
        let handle = Arc::new(RecordedHandle {
            id: created.len(),
            kind,
            properties: properties.clone(),
            closes: AtomicUsize::new(0),
            hook: self.hook.lock().unwrap().clone(),
            observed_on_close: Mutex::new(None),
        });
        created.push(handle.clone());
        Ok(handle)
    }
}

pub fn no_env(_: &str) -> Option<String> {
    None
}

pub fn config(clusters: Vec<KafkaClusterConfig>) -> Config {
    let config: Config = serde_yaml::from_str(
        r#"
main_log_level: "info"
registry:
  client_construction_timeout_ms: 200
  close_timeout_ms: 200
  drain_timeout_ms: 1000
"#,
    )
    .unwrap();
    Config {
        kafka: KafkaConfig {
            clusters,
            ..Default::default()
        },
        ..config
    }
}

/// A statically configured cluster reachable at `<name>:9092`.
pub fn static_cluster(name: &str, id: &str) -> KafkaClusterConfig {
    KafkaClusterConfig {
        name: name.into(),
        id: Some(id.into()),
        listener: "plain".into(),
        properties: BTreeMap::from([(BOOTSTRAP_SERVERS.into(), format!("{name}:9092"))]),
        ..Default::default()
    }
}

/// A cluster that is only registered once its resource in the `kafka` namespace is seen.
pub fn watched_cluster(name: &str) -> KafkaClusterConfig {
    KafkaClusterConfig {
        name: name.into(),
        namespace: Some("kafka".into()),
        listener: "plain".into(),
        ..Default::default()
    }
}

pub fn resource(name: &str, cluster_id: Option<&str>) -> KafkaResource {
    KafkaResource {
        metadata: ObjectMeta {
            namespace: Some("kafka".into()),
            name: name.into(),
        },
        spec: Default::default(),
        status: Some(KafkaStatus {
            cluster_id: cluster_id.map(str::to_owned),
            listeners: vec![ListenerStatus {
                name: "plain".into(),
                bootstrap_servers: Some(format!("{name}-bootstrap:9092")),
                ..Default::default()
            }],
        }),
    }
}

/// As [`resource`], with the `plain` listener authenticating through OAUTHBEARER.
pub fn oauth_resource(name: &str, cluster_id: &str) -> KafkaResource {
    KafkaResource {
        spec: KafkaSpec {
            kafka: KafkaClusterSpec {
                listeners: vec![ListenerSpec {
                    name: "plain".into(),
                    tls: false,
                    authentication: Some(ListenerAuthentication {
                        auth_type: "oauth".into(),
                    }),
                }],
            },
        },
        ..resource(name, Some(cluster_id))
    }
}

pub async fn start(
    config: &Config,
    resources: &ResourceStore,
    factory: Arc<RecordingFactory>,
) -> Services {
    let merger = ConfigMerger::new(
        config.kafka.client_defaults.clone(),
        factory,
        config.registry.client_construction_timeout(),
    )
    .with_env(Arc::new(no_env));
    Services::start_with(config, resources, merger).await
}

/// Waits until `condition` holds, failing the test after a few seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition was not met in time");
}

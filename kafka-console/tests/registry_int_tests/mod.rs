use crate::helpers::{
    RecordingFactory, config, eventually, resource, start, static_cluster, watched_cluster,
};
use kafka_console::context::ContextScope;
use kafka_console::properties::{BOOTSTRAP_SERVERS, ClientKind};
use kafka_console::resource::{ResourceEvent, ResourceStore};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[tokio::test]
async fn configured_clusters_register_with_shared_admin() {
    let factory = RecordingFactory::new();
    let config = config(vec![static_cluster("a", "id-a"), static_cluster("b", "id-b")]);
    let services = start(&config, &ResourceStore::default(), factory.clone()).await;

    assert_eq!(services.registry.cluster_ids(), vec!["id-a", "id-b"]);
    let admins = factory.created_of(ClientKind::Admin);
    assert_eq!(admins.len(), 2);

    let context = services.registry.get("id-a").unwrap();
    assert_eq!(context.cluster_key(), "a");
    assert_eq!(context.scope(), ContextScope::Registry);
    assert!(context.admin().is_some());
    assert_eq!(
        context.properties(ClientKind::Producer)[BOOTSTRAP_SERVERS],
        "a:9092"
    );

    services.shutdown().await.unwrap();
}

#[tokio::test]
async fn cluster_without_bootstrap_is_not_registered() {
    let factory = RecordingFactory::new();
    let mut incomplete = static_cluster("a", "id-a");
    incomplete.properties.clear();
    let config = config(vec![incomplete, static_cluster("b", "id-b")]);
    let services = start(&config, &ResourceStore::default(), factory.clone()).await;

    assert_eq!(services.registry.cluster_ids(), vec!["id-b"]);
    assert_eq!(factory.created().len(), 1);
}

#[tokio::test]
async fn cached_resources_register_at_startup() {
    let factory = RecordingFactory::new();
    let config = config(vec![watched_cluster("my-cluster"), watched_cluster("other")]);
    let resources = ResourceStore::new([resource("my-cluster", Some("abc"))]);
    let services = start(&config, &resources, factory.clone()).await;

    assert_eq!(services.registry.cluster_ids(), vec!["abc"]);
    let context = services.registry.get("abc").unwrap();
    assert_eq!(context.cluster_key(), "kafka/my-cluster");
    assert_eq!(
        context.properties(ClientKind::Admin)[BOOTSTRAP_SERVERS],
        "my-cluster-bootstrap:9092"
    );
}

#[tokio::test]
async fn update_replaces_context_once_and_closes_old_after_swap() {
    let factory = RecordingFactory::new();
    let config = config(vec![watched_cluster("my-cluster")]);
    let services = start(&config, &ResourceStore::default(), factory.clone()).await;
    assert!(services.registry.is_empty());

    let registry = services.registry.clone();
    factory.set_close_hook(move || {
        registry
            .get("abc")
            .and_then(|context| context.admin().map(|admin| format!("{admin:?}")))
    });

    let discovered = resource("my-cluster", Some("abc"));
    services
        .events
        .send(ResourceEvent::Added(discovered.clone()))
        .await
        .unwrap();
    eventually(|| services.registry.get("abc").is_some()).await;

    services
        .events
        .send(ResourceEvent::Updated {
            old: discovered.clone(),
            new: discovered,
        })
        .await
        .unwrap();
    eventually(|| factory.created_of(ClientKind::Admin).len() == 2).await;

    let admins = factory.created_of(ClientKind::Admin);
    eventually(|| admins[0].closes() == 1).await;
    // the replacement was already visible when the old admin was closed
    assert_eq!(
        admins[0].observed_on_close(),
        Some("RecordedHandle(1)".to_owned())
    );
    assert_eq!(admins[1].closes(), 0);
    assert_eq!(services.registry.len(), 1);

    services.shutdown().await.unwrap();
    assert_eq!(admins[0].closes(), 1);
    assert_eq!(admins[1].closes(), 1);
}

#[tokio::test]
async fn update_with_new_id_moves_registration() {
    let factory = RecordingFactory::new();
    let config = config(vec![watched_cluster("my-cluster")]);
    let services = start(&config, &ResourceStore::default(), factory.clone()).await;

    let first = resource("my-cluster", Some("one"));
    let second = resource("my-cluster", Some("two"));
    services
        .events
        .send(ResourceEvent::Added(first.clone()))
        .await
        .unwrap();
    services
        .events
        .send(ResourceEvent::Updated {
            old: first,
            new: second,
        })
        .await
        .unwrap();

    eventually(|| services.registry.cluster_ids() == vec!["two"]).await;
    let admins = factory.created_of(ClientKind::Admin);
    eventually(|| admins[0].closes() == 1).await;
    assert_eq!(admins[1].closes(), 0);
}

#[tokio::test]
async fn resource_without_id_waits_for_update() {
    let factory = RecordingFactory::new();
    let config = config(vec![watched_cluster("my-cluster")]);
    let services = start(&config, &ResourceStore::default(), factory.clone()).await;

    let pending = resource("my-cluster", None);
    let ready = resource("my-cluster", Some("abc"));
    services
        .events
        .send(ResourceEvent::Added(pending.clone()))
        .await
        .unwrap();
    services
        .events
        .send(ResourceEvent::Updated {
            old: pending,
            new: ready,
        })
        .await
        .unwrap();

    eventually(|| services.registry.get("abc").is_some()).await;
    assert_eq!(factory.created().len(), 1);
}

#[tokio::test]
async fn removal_closes_context() {
    let factory = RecordingFactory::new();
    let config = config(vec![watched_cluster("my-cluster")]);
    let discovered = resource("my-cluster", Some("abc"));
    let services = start(
        &config,
        &ResourceStore::new([discovered.clone()]),
        factory.clone(),
    )
    .await;
    assert_eq!(services.registry.len(), 1);

    services
        .events
        .send(ResourceEvent::Removed(discovered))
        .await
        .unwrap();
    eventually(|| services.registry.is_empty()).await;

    let admins = factory.created_of(ClientKind::Admin);
    eventually(|| admins[0].closes() == 1).await;
}

#[tokio::test]
async fn removal_of_unregistered_resource_is_ignored() {
    let factory = RecordingFactory::new();
    let config = config(vec![static_cluster("a", "id-a"), watched_cluster("b")]);
    let services = start(&config, &ResourceStore::default(), factory.clone()).await;

    services
        .events
        .send(ResourceEvent::Removed(resource("unknown", Some("zzz"))))
        .await
        .unwrap();
    // never registered, it had no resource until now
    services
        .events
        .send(ResourceEvent::Removed(resource("b", Some("id-b"))))
        .await
        .unwrap();
    services
        .events
        .send(ResourceEvent::Added(resource("b", Some("id-b"))))
        .await
        .unwrap();
    eventually(|| services.registry.get("id-b").is_some()).await;

    assert_eq!(services.registry.cluster_ids(), vec!["id-a", "id-b"]);
    assert!(factory.created().iter().all(|handle| handle.closes() == 0));
}

#[tokio::test]
async fn duplicate_cluster_id_keeps_first_registration() {
    let factory = RecordingFactory::new();
    let config = config(vec![
        static_cluster("a", "abc"),
        watched_cluster("b"),
        watched_cluster("c"),
    ]);
    let services = start(&config, &ResourceStore::default(), factory.clone()).await;

    services
        .events
        .send(ResourceEvent::Added(resource("b", Some("abc"))))
        .await
        .unwrap();
    services
        .events
        .send(ResourceEvent::Added(resource("c", Some("id-c"))))
        .await
        .unwrap();
    eventually(|| services.registry.get("id-c").is_some()).await;

    assert_eq!(services.registry.get("abc").unwrap().cluster_key(), "a");
    // the duplicate is rejected before any client is built for it
    assert_eq!(factory.created().len(), 2);
}

#[tokio::test]
async fn panicking_event_does_not_stop_later_events() {
    let factory = RecordingFactory::new();
    factory.set_panic_on("broken-bootstrap:9092");
    let config = config(vec![watched_cluster("broken"), watched_cluster("healthy")]);
    let services = start(&config, &ResourceStore::default(), factory.clone()).await;

    services
        .events
        .send(ResourceEvent::Added(resource("broken", Some("id-broken"))))
        .await
        .unwrap();
    services
        .events
        .send(ResourceEvent::Added(resource("healthy", Some("id-healthy"))))
        .await
        .unwrap();
    eventually(|| services.registry.get("id-healthy").is_some()).await;

    assert_eq!(services.registry.cluster_ids(), vec!["id-healthy"]);
    assert_eq!(factory.created().len(), 1);
    assert!(factory.started() >= 2);

    let report = services.shutdown().await.unwrap();
    assert_eq!(report.len(), 1);
}

#[tokio::test]
async fn shutdown_closes_every_context() {
    let factory = RecordingFactory::new();
    let config = config(vec![static_cluster("a", "id-a"), static_cluster("b", "id-b")]);
    let services = start(&config, &ResourceStore::default(), factory.clone()).await;

    let report = services.shutdown().await.unwrap();
    let mut closed: Vec<&str> = report
        .iter()
        .filter(|(_, outcome)| outcome.is_value())
        .map(|(cluster_id, _)| cluster_id.as_str())
        .collect();
    closed.sort();
    assert_eq!(closed, vec!["id-a", "id-b"]);
    assert!(services.registry.is_empty());
    assert!(factory.created().iter().all(|handle| handle.closes() == 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_never_observe_partial_or_closed_context_during_replacement() {
    const READERS: usize = 8;
    const UPDATES: usize = 20;

    let factory = RecordingFactory::new();
    let config = config(vec![watched_cluster("my-cluster")]);
    let initial = resource("my-cluster", Some("abc"));
    let services = start(
        &config,
        &ResourceStore::new([initial.clone()]),
        factory.clone(),
    )
    .await;

    let stop = Arc::new(AtomicBool::new(false));
    let reads = Arc::new(AtomicUsize::new(0));
    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let registry = services.registry.clone();
            let stop = stop.clone();
            let reads = reads.clone();
            tokio::spawn(async move {
                while !stop.load(Ordering::Acquire) {
                    let context = registry.get("abc").expect("cluster disappeared");
                    assert!(!context.is_closed());
                    assert!(context.admin().is_some());
                    for kind in ClientKind::ALL {
                        assert!(
                            context.properties(kind)[BOOTSTRAP_SERVERS].starts_with("broker-")
                                || context.properties(kind)[BOOTSTRAP_SERVERS]
                                    == "my-cluster-bootstrap:9092"
                        );
                    }
                    reads.fetch_add(1, Ordering::Relaxed);
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    let mut old = initial;
    for i in 0..UPDATES {
        let mut new = old.clone();
        if let Some(status) = &mut new.status {
            status.listeners[0].bootstrap_servers = Some(format!("broker-{i}:9092"));
        }
        services
            .events
            .send(ResourceEvent::Updated {
                old,
                new: new.clone(),
            })
            .await
            .unwrap();
        old = new;
    }

    let last = format!("broker-{}:9092", UPDATES - 1);
    eventually(|| {
        services.registry.get("abc").unwrap().properties(ClientKind::Admin)[BOOTSTRAP_SERVERS]
            == last
    })
    .await;
    stop.store(true, Ordering::Release);
    for reader in readers {
        reader.await.unwrap();
    }
    assert!(reads.load(Ordering::Relaxed) > 0);

    let admins = factory.created_of(ClientKind::Admin);
    let replaced = &admins[..UPDATES];
    eventually(|| replaced.iter().all(|admin| admin.closes() == 1)).await;
    assert_eq!(admins.len(), UPDATES + 1);
    assert_eq!(admins[UPDATES].closes(), 0);
}

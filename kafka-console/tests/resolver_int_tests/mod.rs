use crate::helpers::{
    RecordingFactory, config, oauth_resource, start, static_cluster, watched_cluster,
};
use base64::Engine;
use base64::engine::general_purpose;
use kafka_console::config::KafkaClusterConfig;
use kafka_console::credentials::AuthFailure;
use kafka_console::error::{ErrorCategory, RegistryError};
use kafka_console::properties::{
    ClientKind, GROUP_ID, SASL_JAAS_CONFIG, SASL_MECHANISM, SECURITY_PROTOCOL,
};
use kafka_console::resource::ResourceStore;
use kafka_console::services::Services;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

async fn oauth_services(factory: Arc<RecordingFactory>) -> Services {
    let config = config(vec![watched_cluster("secure")]);
    let resources = ResourceStore::new([oauth_resource("secure", "abc")]);
    start(&config, &resources, factory).await
}

fn plain_cluster() -> KafkaClusterConfig {
    let mut cluster = static_cluster("plain", "abc");
    cluster
        .properties
        .insert(SECURITY_PROTOCOL.into(), "SASL_PLAINTEXT".into());
    cluster.properties.insert(SASL_MECHANISM.into(), "PLAIN".into());
    cluster
}

fn basic(raw: &str) -> String {
    format!("Basic {}", general_purpose::STANDARD.encode(raw))
}

#[tokio::test]
async fn shared_admin_is_handed_out_without_disposal() {
    let factory = RecordingFactory::new();
    let services = start(
        &config(vec![static_cluster("a", "abc")]),
        &ResourceStore::default(),
        factory.clone(),
    )
    .await;

    let resolved = services.resolver.resolve("abc", None).await.unwrap();
    assert!(!resolved.is_request_scoped());
    assert!(Arc::ptr_eq(
        resolved.context(),
        &services.registry.get("abc").unwrap()
    ));

    resolved.dispose().await;
    resolved.dispose().await;
    assert!(resolved.disposer().is_disposed());
    assert!(!resolved.context().is_closed());
    assert_eq!(factory.created().len(), 1);
    assert_eq!(factory.created()[0].closes(), 0);
}

#[tokio::test]
async fn unknown_cluster_is_not_found() {
    let services = oauth_services(RecordingFactory::new()).await;

    let err = services.resolver.resolve("missing", None).await.err().unwrap();
    assert!(matches!(err, RegistryError::ClusterNotFound { .. }));
    assert_eq!(err.category(), ErrorCategory::RESOURCE_NOT_FOUND);
}

#[tokio::test]
async fn oauth_cluster_defers_admin_to_request() {
    let factory = RecordingFactory::new();
    let services = oauth_services(factory.clone()).await;

    let registered = services.registry.get("abc").unwrap();
    assert!(registered.admin().is_none());
    assert!(registered.requires_authentication(ClientKind::Admin));
    assert!(factory.created().is_empty());

    let err = services.resolver.resolve("abc", None).await.err().unwrap();
    assert_eq!(err.category(), ErrorCategory::NOT_AUTHENTICATED);
    assert_eq!(err.challenge(), Some("Bearer"));

    let resolved = services
        .resolver
        .resolve("abc", Some("Bearer token-1"))
        .await
        .unwrap();
    assert!(resolved.is_request_scoped());
    assert!(resolved.admin().is_some());

    let admins = factory.created_of(ClientKind::Admin);
    assert_eq!(admins.len(), 1);
    assert!(admins[0].properties[SASL_JAAS_CONFIG].contains("oauth.access.token=\"token-1\""));
    // the registered context is never authenticated
    assert!(
        !registered
            .properties(ClientKind::Admin)
            .contains_key(SASL_JAAS_CONFIG)
    );

    resolved.dispose().await;
    resolved.dispose().await;
    assert_eq!(admins[0].closes(), 1);
    assert!(resolved.context().is_closed());
    assert!(!registered.is_closed());
}

#[tokio::test]
async fn consumers_are_built_per_request() {
    let factory = RecordingFactory::new();
    let services = oauth_services(factory.clone()).await;

    let resolved = services
        .resolver
        .resolve("abc", Some("Bearer token-1"))
        .await
        .unwrap();
    let first = resolved.consumer().await.unwrap();
    let second = resolved.consumer().await.unwrap();
    assert!(!Arc::ptr_eq(first.handle(), second.handle()));

    let consumers = factory.created_of(ClientKind::Consumer);
    assert_eq!(consumers.len(), 2);
    assert!(!consumers[0].properties.contains_key(GROUP_ID));
    assert!(consumers[0].properties[SASL_JAAS_CONFIG].contains("token-1"));

    first.dispose().await;
    first.dispose().await;
    assert_eq!(consumers[0].closes(), 1);
    assert_eq!(consumers[1].closes(), 0);

    drop(second);
    crate::helpers::eventually(|| consumers[1].closes() == 1).await;
    resolved.dispose().await;
}

#[tokio::test]
async fn basic_credentials_for_plain_cluster() {
    let factory = RecordingFactory::new();
    let services = start(
        &config(vec![plain_cluster()]),
        &ResourceStore::default(),
        factory.clone(),
    )
    .await;
    assert!(services.registry.get("abc").unwrap().admin().is_none());

    let err = services
        .resolver
        .resolve("abc", Some(&basic("alice:")))
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        RegistryError::AuthenticationRequired(AuthFailure::EmptyCredentials)
    ));
    assert_eq!(err.challenge(), Some("Basic"));

    let resolved = services
        .resolver
        .resolve("abc", Some(&basic("alice:secret")))
        .await
        .unwrap();
    let admins = factory.created_of(ClientKind::Admin);
    assert_eq!(
        admins[0].properties[SASL_JAAS_CONFIG],
        "org.apache.kafka.common.security.plain.PlainLoginModule required username=\"alice\" password=\"secret\" ;"
    );
    resolved.dispose().await;
}

#[tokio::test]
async fn with_context_disposes_after_use() {
    let factory = RecordingFactory::new();
    let services = oauth_services(factory.clone()).await;

    let scoped = services
        .resolver
        .with_context("abc", Some("Bearer token-1"), |resolved| async move {
            Ok::<_, RegistryError>(resolved.is_request_scoped())
        })
        .await
        .unwrap();
    assert!(scoped);
    assert_eq!(factory.created_of(ClientKind::Admin)[0].closes(), 1);
}

#[tokio::test]
async fn failed_shared_admin_falls_back_to_request_scope() {
    let factory = RecordingFactory::new();
    factory.set_failing(true);
    let services = start(
        &config(vec![static_cluster("a", "abc")]),
        &ResourceStore::default(),
        factory.clone(),
    )
    .await;

    // still registered, just without a shared admin
    assert!(services.registry.get("abc").unwrap().admin().is_none());

    let err = services.resolver.resolve("abc", None).await.err().unwrap();
    assert!(matches!(
        err,
        RegistryError::HandleConstructionFailed {
            kind: ClientKind::Admin,
            ..
        }
    ));
    assert_eq!(err.category(), ErrorCategory::BACKEND_UNAVAILABLE);

    factory.set_failing(false);
    let resolved = services.resolver.resolve("abc", None).await.unwrap();
    assert!(resolved.is_request_scoped());
    resolved.dispose().await;
    assert_eq!(factory.created()[0].closes(), 1);
}

#[tokio::test]
async fn slow_construction_times_out() {
    let factory = RecordingFactory::new();
    factory.set_delay(Duration::from_secs(2));
    let services = start(
        &config(vec![static_cluster("a", "abc")]),
        &ResourceStore::default(),
        factory.clone(),
    )
    .await;
    assert!(services.registry.get("abc").unwrap().admin().is_none());

    let err = services.resolver.resolve("abc", None).await.err().unwrap();
    assert!(matches!(
        err,
        RegistryError::HandleConstructionTimeout {
            timeout,
            ..
        } if timeout == Duration::from_millis(200)
    ));
    assert_eq!(err.category(), ErrorCategory::BACKEND_TIMEOUT);
    assert!(factory.created().is_empty());
}

#[tokio::test]
async fn cancelled_request_abandons_construction() {
    let factory = RecordingFactory::new();
    let services = oauth_services(factory.clone()).await;
    factory.set_delay(Duration::from_millis(150));

    let cancelled = tokio::time::timeout(
        Duration::from_millis(20),
        services.resolver.resolve("abc", Some("Bearer token-1")),
    )
    .await;
    assert!(cancelled.is_err());
    assert_eq!(factory.started(), 1);

    // past the point the factory would have finished
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(factory.created().is_empty());
    assert!(!services.registry.get("abc").unwrap().is_closed());
}

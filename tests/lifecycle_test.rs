//! Integration tests for idle suspension and resume against real host processes

#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use termhub::adapter::{
    AdapterFactory, CreateSessionOptions, DockerDefaults, EnvironmentAdapter, EventEmitter,
    HostAdapterConfig,
};
use termhub::domain::{PauseReason, SessionRecord};
use termhub::lifecycle::{
    FactoryStopper, LifecycleConfig, LifecycleEvent, ProcessLifecycleManager,
};
use termhub::store::InMemoryEnvironmentStore;

use common::create_workspace;

fn setup() -> (Arc<AdapterFactory>, Arc<InMemoryEnvironmentStore>, Arc<ProcessLifecycleManager>) {
    let (events, _rx) = EventEmitter::channel();
    let factory = Arc::new(AdapterFactory::new(
        HostAdapterConfig {
            agent_program: "/bin/sh".to_string(),
            ..HostAdapterConfig::default()
        },
        DockerDefaults::default(),
        events,
    ));
    let store = Arc::new(InMemoryEnvironmentStore::new());
    let lifecycle = Arc::new(ProcessLifecycleManager::new(
        LifecycleConfig {
            idle_timeout_minutes: 10,
            shutdown_grace: Duration::from_secs(2),
            ..LifecycleConfig::default()
        },
        factory.clone(),
        store.clone(),
        Arc::new(FactoryStopper::new(factory.clone())),
    ));
    (factory, store, lifecycle)
}

#[tokio::test]
async fn test_idle_session_is_suspended_then_resumed() {
    let (factory, store, lifecycle) = setup();
    let workspace = create_workspace();
    store.insert_session(SessionRecord::new("s1", workspace.path()));
    let mut events = lifecycle.subscribe();

    let host = factory.host_adapter();
    host.create_session("s1", workspace.path(), None, CreateSessionOptions::default())
        .await
        .unwrap();
    lifecycle.update_activity_at("s1", Utc::now() - chrono::Duration::minutes(11));

    assert_eq!(lifecycle.check_idle_sessions().await, vec!["s1".to_string()]);
    assert!(!host.has_session("s1"));
    assert_eq!(lifecycle.last_activity("s1"), None);
    assert_eq!(
        events.recv().await.unwrap(),
        LifecycleEvent::Paused {
            session_id: "s1".into(),
            reason: PauseReason::IdleTimeout,
        }
    );

    lifecycle
        .resume_session("s1", workspace.path(), None)
        .await
        .unwrap();
    assert!(host.has_session("s1"));
    assert!(lifecycle.last_activity("s1").is_some());
    assert_eq!(
        events.recv().await.unwrap(),
        LifecycleEvent::Resumed {
            session_id: "s1".into(),
            resumed_with_history: false,
        }
    );

    host.destroy_session("s1").await;
}

#[tokio::test]
async fn test_shutdown_pauses_running_sessions() {
    let (factory, store, lifecycle) = setup();
    let workspace = create_workspace();
    store.insert_session(SessionRecord::new("s1", workspace.path()));
    store.insert_session(SessionRecord::new("s2", workspace.path()));

    let host = factory.host_adapter();
    for id in ["s1", "s2"] {
        host.create_session(id, workspace.path(), None, CreateSessionOptions::default())
            .await
            .unwrap();
    }

    lifecycle
        .initiate_shutdown(termhub::domain::ShutdownSignal::Sigterm)
        .await;

    assert!(factory.active_sessions().is_empty());
    assert!(lifecycle.is_shutdown_in_progress());
}

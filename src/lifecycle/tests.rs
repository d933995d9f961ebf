use std::time::Instant;

use chrono::Duration as ChronoDuration;

use super::*;
use crate::adapter::{DockerDefaults, EventEmitter, HostAdapterConfig};
use crate::domain::{ExecutionEnvironment, SessionRecord};
use crate::store::InMemoryEnvironmentStore;

/// Records stop calls, optionally taking a while for each
#[derive(Default)]
struct RecordingStopper {
    stopped: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

#[async_trait]
impl LegacyProcessStopper for RecordingStopper {
    async fn stop(&self, session_id: &str) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.stopped.lock().unwrap().push(session_id.to_string());
    }
}

fn manager_with(
    idle_timeout_minutes: u64,
    store: Arc<InMemoryEnvironmentStore>,
    stopper: Arc<RecordingStopper>,
) -> Arc<ProcessLifecycleManager> {
    let factory = Arc::new(AdapterFactory::new(
        HostAdapterConfig::default(),
        DockerDefaults::default(),
        EventEmitter::channel().0,
    ));
    let config = LifecycleConfig {
        idle_timeout_minutes,
        shutdown_grace: Duration::from_millis(200),
        ..LifecycleConfig::default()
    };
    Arc::new(ProcessLifecycleManager::new(config, factory, store, stopper))
}

fn manager(idle_timeout_minutes: u64) -> Arc<ProcessLifecycleManager> {
    manager_with(
        idle_timeout_minutes,
        Arc::new(InMemoryEnvironmentStore::new()),
        Arc::new(RecordingStopper::default()),
    )
}

#[test]
fn test_effective_idle_timeout() {
    assert_eq!(effective_idle_timeout(0), None);
    assert_eq!(effective_idle_timeout(1), Some(5));
    assert_eq!(effective_idle_timeout(5), Some(5));
    assert_eq!(effective_idle_timeout(45), Some(45));
}

#[test]
fn test_activity_tracking() {
    let manager = manager(30);
    assert_eq!(manager.last_activity("s1"), None);
    manager.update_activity("s1");
    assert!(manager.last_activity("s1").is_some());
    assert_eq!(manager.tracked_sessions(), vec!["s1".to_string()]);
    manager.clear_activity("s1");
    manager.clear_activity("s1");
    assert!(manager.tracked_sessions().is_empty());
}

#[test]
fn test_idle_sessions_respect_threshold() {
    let manager = manager(30);
    let now = Utc::now();
    manager.update_activity_at("stale", now - ChronoDuration::minutes(31));
    manager.update_activity_at("fresh", now - ChronoDuration::minutes(29));
    assert_eq!(manager.idle_sessions_at(now), vec!["stale".to_string()]);
}

#[test]
fn test_idle_threshold_clamped_to_floor() {
    let manager = manager(1);
    let now = Utc::now();
    manager.update_activity_at("s1", now - ChronoDuration::minutes(3));
    assert!(manager.idle_sessions_at(now).is_empty());
    manager.update_activity_at("s1", now - ChronoDuration::minutes(6));
    assert_eq!(manager.idle_sessions_at(now), vec!["s1".to_string()]);
}

#[test]
fn test_zero_timeout_disables_idle_scan() {
    let manager = manager(0);
    let now = Utc::now();
    manager.update_activity_at("ancient", now - ChronoDuration::days(30));
    assert!(manager.idle_sessions_at(now).is_empty());
}

#[tokio::test]
async fn test_pause_unknown_session_uses_legacy_path() {
    let stopper = Arc::new(RecordingStopper::default());
    let manager = manager_with(30, Arc::new(InMemoryEnvironmentStore::new()), stopper.clone());
    let mut events = manager.subscribe();
    manager.update_activity("s1");

    manager.pause_session("s1", PauseReason::Manual).await;

    assert_eq!(*stopper.stopped.lock().unwrap(), vec!["s1".to_string()]);
    assert_eq!(manager.last_activity("s1"), None);
    assert_eq!(
        events.recv().await.unwrap(),
        LifecycleEvent::Paused {
            session_id: "s1".into(),
            reason: PauseReason::Manual,
        }
    );
}

#[tokio::test]
async fn test_pause_resolved_session_skips_legacy_path() {
    let store = Arc::new(InMemoryEnvironmentStore::new());
    store.insert_environment(ExecutionEnvironment::host("host"));
    store.insert_session(SessionRecord::new("s1", "/tmp"));
    let stopper = Arc::new(RecordingStopper::default());
    let manager = manager_with(30, store, stopper.clone());

    manager.pause_session("s1", PauseReason::IdleTimeout).await;
    assert!(stopper.stopped.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_check_idle_sessions_pauses_and_clears() {
    let manager = manager(30);
    let mut events = manager.subscribe();
    manager.update_activity_at("s1", Utc::now() - ChronoDuration::hours(2));
    manager.update_activity("s2");

    assert_eq!(manager.check_idle_sessions().await, vec!["s1".to_string()]);
    assert_eq!(manager.tracked_sessions(), vec!["s2".to_string()]);
    assert!(matches!(
        events.recv().await.unwrap(),
        LifecycleEvent::Paused { reason: PauseReason::IdleTimeout, .. }
    ));
}

#[tokio::test]
async fn test_resume_missing_directory_fails() {
    let manager = manager(30);
    let dir = tempfile::tempdir().unwrap();
    let err = manager
        .resume_session("s1", &dir.path().join("gone"), Some("abcd-1234"))
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::Session(ref e) if e.is_validation()));
    assert_eq!(manager.last_activity("s1"), None);
}

#[tokio::test]
async fn test_shutdown_is_single_shot() {
    let manager = manager(30);
    let mut events = manager.subscribe();
    manager.update_activity("s1");

    manager.initiate_shutdown(ShutdownSignal::Sigterm).await;
    assert!(manager.is_shutdown_in_progress());
    manager.initiate_shutdown(ShutdownSignal::Sigint).await;

    assert_eq!(
        events.recv().await.unwrap(),
        LifecycleEvent::Shutdown {
            signal: ShutdownSignal::Sigterm
        }
    );
    assert!(matches!(
        events.recv().await.unwrap(),
        LifecycleEvent::Paused { reason: PauseReason::ServerShutdown, .. }
    ));
    assert!(events.try_recv().is_err());

    let err = manager
        .resume_session("s1", Path::new("/tmp"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::ShuttingDown));

    manager.reset();
    assert!(!manager.is_shutdown_in_progress());
}

#[tokio::test]
async fn test_shutdown_bounded_by_grace_period() {
    let stopper = Arc::new(RecordingStopper {
        delay: Some(Duration::from_secs(10)),
        ..RecordingStopper::default()
    });
    let manager = manager_with(30, Arc::new(InMemoryEnvironmentStore::new()), stopper.clone());
    manager.update_activity("slow-1");
    manager.update_activity("slow-2");

    let started = Instant::now();
    manager.initiate_shutdown(ShutdownSignal::Sigint).await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(stopper.stopped.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_idle_checker_start_stop() {
    let manager = manager(30);
    manager.start_idle_checker();
    manager.start_idle_checker();
    assert!(manager.idle_checker.lock().unwrap().is_some());
    manager.stop_idle_checker();
    assert!(manager.idle_checker.lock().unwrap().is_none());

    let disabled = manager_with(
        0,
        Arc::new(InMemoryEnvironmentStore::new()),
        Arc::new(RecordingStopper::default()),
    );
    disabled.start_idle_checker();
    assert!(disabled.idle_checker.lock().unwrap().is_none());
}

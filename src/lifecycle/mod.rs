//! Process lifecycle: activity tracking, idle suspension and shutdown
//!
//! [`ProcessLifecycleManager`] records when each session last saw viewer
//! activity. A background checker suspends sessions that have been idle for
//! longer than the configured timeout, and [`initiate_shutdown`] pauses
//! every running session within a bounded grace period.
//!
//! Suspension destroys the session's process through its adapter; the
//! session itself stays resumable with its resume token.
//!
//! [`initiate_shutdown`]: ProcessLifecycleManager::initiate_shutdown

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapter::{AdapterFactory, CreateSessionOptions, EnvironmentAdapter};
use crate::domain::{PauseReason, ShutdownSignal};
use crate::error::LifecycleError;
use crate::store::EnvironmentStore;

pub const DEFAULT_IDLE_TIMEOUT_MINUTES: u64 = 30;
pub const MIN_IDLE_TIMEOUT_MINUTES: u64 = 5;
pub const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(60);
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Idle timeout actually applied: `None` when disabled (0), otherwise at
/// least [`MIN_IDLE_TIMEOUT_MINUTES`]
pub fn effective_idle_timeout(minutes: u64) -> Option<u64> {
    match minutes {
        0 => None,
        m => Some(m.max(MIN_IDLE_TIMEOUT_MINUTES)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Paused {
        session_id: String,
        reason: PauseReason,
    },
    Resumed {
        session_id: String,
        resumed_with_history: bool,
    },
    Shutdown {
        signal: ShutdownSignal,
    },
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// 0 disables idle suspension
    pub idle_timeout_minutes: u64,
    pub check_interval: Duration,
    pub shutdown_grace: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            idle_timeout_minutes: DEFAULT_IDLE_TIMEOUT_MINUTES,
            check_interval: IDLE_CHECK_INTERVAL,
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }
}

/// Stops a session's process when its environment cannot be resolved
#[async_trait]
pub trait LegacyProcessStopper: Send + Sync {
    async fn stop(&self, session_id: &str);
}

/// Stops whichever cached adapter runs the session, else the host one
pub struct FactoryStopper {
    factory: Arc<AdapterFactory>,
}

impl FactoryStopper {
    pub fn new(factory: Arc<AdapterFactory>) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl LegacyProcessStopper for FactoryStopper {
    async fn stop(&self, session_id: &str) {
        match self.factory.find_adapter_for_session(session_id) {
            Some(adapter) => adapter.destroy_session(session_id).await,
            None => self.factory.host_adapter().destroy_session(session_id).await,
        }
    }
}

pub struct ProcessLifecycleManager {
    config: LifecycleConfig,
    activity: Mutex<HashMap<String, DateTime<Utc>>>,
    factory: Arc<AdapterFactory>,
    store: Arc<dyn EnvironmentStore>,
    legacy: Arc<dyn LegacyProcessStopper>,
    idle_checker: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
    events: broadcast::Sender<LifecycleEvent>,
}

impl ProcessLifecycleManager {
    pub fn new(
        config: LifecycleConfig,
        factory: Arc<AdapterFactory>,
        store: Arc<dyn EnvironmentStore>,
        legacy: Arc<dyn LegacyProcessStopper>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            activity: Mutex::new(HashMap::new()),
            factory,
            store,
            legacy,
            idle_checker: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
            events,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: LifecycleEvent) {
        if self.events.send(event).is_err() {
            debug!("No lifecycle subscribers");
        }
    }

    fn activity(&self) -> std::sync::MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.activity.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn update_activity(&self, session_id: &str) {
        self.update_activity_at(session_id, Utc::now());
    }

    pub fn update_activity_at(&self, session_id: &str, at: DateTime<Utc>) {
        self.activity().insert(session_id.to_string(), at);
    }

    pub fn last_activity(&self, session_id: &str) -> Option<DateTime<Utc>> {
        self.activity().get(session_id).copied()
    }

    pub fn clear_activity(&self, session_id: &str) {
        self.activity().remove(session_id);
    }

    pub fn tracked_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.activity().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Sessions idle for longer than the timeout as of `now`
    pub fn idle_sessions_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let Some(minutes) = effective_idle_timeout(self.config.idle_timeout_minutes) else {
            return Vec::new();
        };
        let threshold = chrono::Duration::minutes(minutes as i64);
        let mut idle: Vec<String> = self
            .activity()
            .iter()
            .filter(|(_, last)| now.signed_duration_since(**last) > threshold)
            .map(|(id, _)| id.clone())
            .collect();
        idle.sort();
        idle
    }

    /// Start the periodic idle check. No-op when idle suspension is disabled
    /// or a checker is already running.
    pub fn start_idle_checker(self: &Arc<Self>) {
        let Some(minutes) = effective_idle_timeout(self.config.idle_timeout_minutes) else {
            info!("Idle suspension disabled");
            return;
        };
        let mut checker = self.idle_checker.lock().unwrap_or_else(|e| e.into_inner());
        if checker.is_some() {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.check_interval;
        info!(idle_timeout_minutes = minutes, interval_secs = period.as_secs(), "Starting idle checker");
        *checker = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // the first tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.check_idle_sessions().await;
            }
        }));
    }

    pub fn stop_idle_checker(&self) {
        if let Some(handle) = self
            .idle_checker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
            debug!("Idle checker stopped");
        }
    }

    /// Pause every idle session; returns the ones paused
    pub async fn check_idle_sessions(&self) -> Vec<String> {
        let idle = self.idle_sessions_at(Utc::now());
        for session_id in &idle {
            info!(session_id = %session_id, "Suspending idle session");
            self.pause_session(session_id, PauseReason::IdleTimeout).await;
        }
        idle
    }

    fn resolve_adapter(&self, session_id: &str) -> Result<Arc<dyn EnvironmentAdapter>, String> {
        let environment = self
            .store
            .environment_for_session(session_id)
            .map_err(|e| e.to_string())?;
        self.factory
            .get_adapter(&environment)
            .map_err(|e| e.to_string())
    }

    /// Stop a session's process. Never fails: when its environment cannot
    /// be resolved the legacy stop path is used instead.
    pub async fn pause_session(&self, session_id: &str, reason: PauseReason) {
        info!(session_id = %session_id, reason = %reason, "Pausing session");
        match self.resolve_adapter(session_id) {
            Ok(adapter) => adapter.destroy_session(session_id).await,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Falling back to legacy stop");
                self.legacy.stop(session_id).await;
            }
        }
        self.clear_activity(session_id);
        self.emit(LifecycleEvent::Paused {
            session_id: session_id.to_string(),
            reason,
        });
    }

    /// Start a new process for a paused session, continuing the earlier
    /// conversation when a resume token is given
    pub async fn resume_session(
        &self,
        session_id: &str,
        working_dir: &Path,
        resume_token: Option<&str>,
    ) -> Result<(), LifecycleError> {
        if self.is_shutdown_in_progress() {
            return Err(LifecycleError::ShuttingDown);
        }
        let adapter = match self.resolve_adapter(session_id) {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Resuming on the host adapter");
                self.factory.host_adapter() as Arc<dyn EnvironmentAdapter>
            }
        };

        let options = CreateSessionOptions {
            resume_token: resume_token.map(str::to_string),
            ..CreateSessionOptions::default()
        };
        adapter
            .create_session(session_id, working_dir, None, options)
            .await
            .map_err(LifecycleError::from)?;

        self.update_activity(session_id);
        let resumed_with_history = resume_token.is_some();
        info!(session_id = %session_id, resumed_with_history, "Session resumed");
        self.emit(LifecycleEvent::Resumed {
            session_id: session_id.to_string(),
            resumed_with_history,
        });
        Ok(())
    }

    pub fn is_shutdown_in_progress(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Pause every active session, giving up after the grace period.
    ///
    /// Only the first call does anything.
    pub async fn initiate_shutdown(&self, signal: ShutdownSignal) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            debug!("Shutdown already in progress");
            return;
        }
        info!(signal = %signal, "Graceful shutdown started");
        self.stop_idle_checker();
        self.emit(LifecycleEvent::Shutdown { signal });

        let sessions: BTreeSet<String> = self
            .factory
            .active_sessions()
            .into_iter()
            .chain(self.tracked_sessions())
            .collect();
        if sessions.is_empty() {
            info!("No active sessions to pause");
            return;
        }

        let count = sessions.len();
        let pauses = sessions
            .iter()
            .map(|id| self.pause_session(id, PauseReason::ServerShutdown));
        match tokio::time::timeout(self.config.shutdown_grace, join_all(pauses)).await {
            Ok(_) => info!(sessions = count, "All sessions paused"),
            Err(_) => warn!(
                sessions = count,
                grace_secs = self.config.shutdown_grace.as_secs_f64(),
                "Shutdown grace period elapsed before all sessions paused"
            ),
        }
    }

    /// Back to a fresh state (for tests and re-initialisation)
    pub fn reset(&self) {
        self.stop_idle_checker();
        self.activity().clear();
        self.shutting_down.store(false, Ordering::Release);
    }
}

impl Drop for ProcessLifecycleManager {
    fn drop(&mut self) {
        self.stop_idle_checker();
    }
}

#[cfg(test)]
mod tests;

//! Lookup of sessions and execution environments
//!
//! The hub and the lifecycle manager only need to read a session's record,
//! find the environment it runs in, and write back what they learn about it.
//! Durable storage lives behind [`EnvironmentStore`]; the in-memory store
//! seeded from the config file is what the server uses.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::config::Config;
use crate::domain::{ExecutionEnvironment, SessionRecord};
use crate::error::LookupError;

/// Id of the environment used by sessions that name none
pub const DEFAULT_ENVIRONMENT_ID: &str = "host";

pub trait EnvironmentStore: Send + Sync {
    fn session(&self, session_id: &str) -> Option<SessionRecord>;

    fn environment(&self, environment_id: &str) -> Option<ExecutionEnvironment>;

    /// Environment for sessions without an explicit one
    fn default_environment(&self) -> ExecutionEnvironment {
        ExecutionEnvironment::host(DEFAULT_ENVIRONMENT_ID)
    }

    /// Remember a detected agent conversation id; it becomes the resume token
    fn record_agent_session_id(&self, session_id: &str, agent_session_id: &str);

    /// Note that the session's process has been started once
    fn mark_started(&self, session_id: &str);

    /// Environment a session is configured to run in
    fn environment_for_session(
        &self,
        session_id: &str,
    ) -> Result<ExecutionEnvironment, LookupError> {
        let session = self
            .session(session_id)
            .ok_or_else(|| LookupError::SessionNotFound(session_id.to_string()))?;
        match session.environment_id {
            Some(id) => self
                .environment(&id)
                .ok_or(LookupError::EnvironmentNotFound(id)),
            None => Ok(self.default_environment()),
        }
    }
}

#[derive(Default)]
struct StoreInner {
    sessions: HashMap<String, SessionRecord>,
    environments: HashMap<String, ExecutionEnvironment>,
}

#[derive(Default)]
pub struct InMemoryEnvironmentStore {
    inner: Mutex<StoreInner>,
}

impl InMemoryEnvironmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Self {
        let store = Self::new();
        for environment in &config.environment {
            store.insert_environment(environment.clone());
        }
        for session in &config.session {
            store.insert_session(session.clone());
        }
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert_session(&self, record: SessionRecord) {
        self.lock().sessions.insert(record.id.clone(), record);
    }

    pub fn insert_environment(&self, environment: ExecutionEnvironment) {
        self.lock()
            .environments
            .insert(environment.id.clone(), environment);
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }
}

impl EnvironmentStore for InMemoryEnvironmentStore {
    fn session(&self, session_id: &str) -> Option<SessionRecord> {
        self.lock().sessions.get(session_id).cloned()
    }

    fn environment(&self, environment_id: &str) -> Option<ExecutionEnvironment> {
        self.lock().environments.get(environment_id).cloned()
    }

    fn default_environment(&self) -> ExecutionEnvironment {
        self.environment(DEFAULT_ENVIRONMENT_ID)
            .unwrap_or_else(|| ExecutionEnvironment::host(DEFAULT_ENVIRONMENT_ID))
    }

    fn record_agent_session_id(&self, session_id: &str, agent_session_id: &str) {
        let mut inner = self.lock();
        match inner.sessions.get_mut(session_id) {
            Some(record) => {
                record.agent_session_id = Some(agent_session_id.to_string());
                record.resume_token = Some(agent_session_id.to_string());
            }
            None => debug!(session_id = %session_id, "Agent session id for unknown session"),
        }
    }

    fn mark_started(&self, session_id: &str) {
        if let Some(record) = self.lock().sessions.get_mut(session_id) {
            record.started = true;
        }
    }
}

//! Adapter selection and caching per execution environment

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use tracing::info;

use super::docker::{DockerAdapter, DockerAdapterConfig};
use super::host::{HostAdapter, HostAdapterConfig};
use super::options::AgentOptions;
use super::{EnvironmentAdapter, EventEmitter};
use crate::domain::{EnvironmentKind, ExecutionEnvironment};
use crate::error::SessionError;

/// Settings shared by every docker environment unless it overrides them
#[derive(Debug, Clone)]
pub struct DockerDefaults {
    pub image_name: String,
    pub image_tag: String,
    pub docker_program: String,
    pub agent_program: String,
    pub default_agent_options: AgentOptions,
}

impl Default for DockerDefaults {
    fn default() -> Self {
        let base = DockerAdapterConfig::default();
        Self {
            image_name: base.image_name,
            image_tag: base.image_tag,
            docker_program: base.docker_program,
            agent_program: base.agent_program,
            default_agent_options: base.default_agent_options,
        }
    }
}

/// Hands out the adapter for an execution environment.
///
/// There is one shared host adapter and one docker adapter per docker
/// environment id, built on first use. All adapters report to the same
/// event emitter.
pub struct AdapterFactory {
    host_config: HostAdapterConfig,
    docker_defaults: DockerDefaults,
    events: EventEmitter,
    host: Mutex<Option<Arc<HostAdapter>>>,
    docker: Mutex<HashMap<String, Arc<DockerAdapter>>>,
}

impl AdapterFactory {
    pub fn new(
        host_config: HostAdapterConfig,
        docker_defaults: DockerDefaults,
        events: EventEmitter,
    ) -> Self {
        Self {
            host_config,
            docker_defaults,
            events,
            host: Mutex::new(None),
            docker: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_adapter(
        &self,
        environment: &ExecutionEnvironment,
    ) -> Result<Arc<dyn EnvironmentAdapter>, SessionError> {
        match environment.kind {
            EnvironmentKind::Host => Ok(self.host_adapter() as Arc<dyn EnvironmentAdapter>),
            EnvironmentKind::Docker => {
                Ok(self.docker_adapter(environment)? as Arc<dyn EnvironmentAdapter>)
            }
            EnvironmentKind::Ssh => Err(SessionError::UnsupportedEnvironment(EnvironmentKind::Ssh)),
        }
    }

    pub fn host_adapter(&self) -> Arc<HostAdapter> {
        let mut host = self.host.lock().unwrap_or_else(|e| e.into_inner());
        host.get_or_insert_with(|| {
            info!("Creating host adapter");
            Arc::new(HostAdapter::new(self.host_config.clone(), self.events.clone()))
        })
        .clone()
    }

    fn docker_adapter(
        &self,
        environment: &ExecutionEnvironment,
    ) -> Result<Arc<DockerAdapter>, SessionError> {
        let mut docker = self.docker.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(adapter) = docker.get(&environment.id) {
            return Ok(adapter.clone());
        }

        let auth_dir = environment.auth_dir.clone().ok_or_else(|| {
            SessionError::EnvironmentConfig(
                environment.id.clone(),
                "docker environments need an auth_dir".to_string(),
            )
        })?;
        let defaults = &self.docker_defaults;
        let config = DockerAdapterConfig {
            environment_id: environment.id.clone(),
            image_name: environment
                .image_name
                .clone()
                .unwrap_or_else(|| defaults.image_name.clone()),
            image_tag: environment
                .image_tag
                .clone()
                .unwrap_or_else(|| defaults.image_tag.clone()),
            auth_dir,
            docker_program: defaults.docker_program.clone(),
            agent_program: defaults.agent_program.clone(),
            default_agent_options: defaults.default_agent_options.clone(),
        };

        info!(
            environment_id = %environment.id,
            image = %format!("{}:{}", config.image_name, config.image_tag),
            "Creating docker adapter"
        );
        let adapter = Arc::new(DockerAdapter::new(config, self.events.clone()));
        docker.insert(environment.id.clone(), adapter.clone());
        Ok(adapter)
    }

    /// Forget a docker environment's adapter (after the environment is
    /// deleted or reconfigured). Returns whether one was cached.
    pub fn remove_docker_adapter(&self, environment_id: &str) -> bool {
        self.docker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(environment_id)
            .is_some()
    }

    pub fn docker_adapter_count(&self) -> usize {
        self.docker.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn all_adapters(&self) -> Vec<Arc<dyn EnvironmentAdapter>> {
        let mut adapters: Vec<Arc<dyn EnvironmentAdapter>> = Vec::new();
        if let Some(host) = self.host.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            adapters.push(host);
        }
        let docker = self.docker.lock().unwrap_or_else(|e| e.into_inner());
        adapters.extend(
            docker
                .values()
                .map(|a| a.clone() as Arc<dyn EnvironmentAdapter>),
        );
        adapters
    }

    /// Every session id with a live process, across all adapters
    pub fn active_sessions(&self) -> Vec<String> {
        self.all_adapters()
            .iter()
            .flat_map(|a| a.session_ids())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// The cached adapter currently running `session_id`
    pub fn find_adapter_for_session(&self, session_id: &str) -> Option<Arc<dyn EnvironmentAdapter>> {
        self.all_adapters()
            .into_iter()
            .find(|a| a.has_session(session_id))
    }

    /// Drop every cached adapter, killing their processes
    pub fn reset(&self) {
        self.host.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.docker.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

//! Configuration loading and management

mod io;
mod settings;

pub use settings::{
    DockerSettings, HostSettings, LifecycleSettings, ScrollbackSettings, ServerSettings,
};

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::adapter::{DockerDefaults, HostAdapterConfig};
use crate::domain::{ExecutionEnvironment, SessionRecord};
use crate::lifecycle::LifecycleConfig;

pub const ENV_IDLE_TIMEOUT_MINUTES: &str = "TERMHUB_IDLE_TIMEOUT_MINUTES";
pub const ENV_SCROLLBACK_BYTES: &str = "TERMHUB_SCROLLBACK_BYTES";
pub const ENV_BIND: &str = "TERMHUB_BIND";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub lifecycle: LifecycleSettings,

    #[serde(default)]
    pub scrollback: ScrollbackSettings,

    #[serde(default)]
    pub host: HostSettings,

    #[serde(default)]
    pub docker: DockerSettings,

    /// Execution environments sessions can run in
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment: Vec<ExecutionEnvironment>,

    /// Known sessions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub session: Vec<SessionRecord>,
}

impl Config {
    /// Override file values from `TERMHUB_*` variables.
    ///
    /// Values that do not parse are ignored with a warning.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = lookup(ENV_IDLE_TIMEOUT_MINUTES) {
            match raw.trim().parse::<u64>() {
                Ok(minutes) => self.lifecycle.idle_timeout_minutes = minutes,
                Err(_) => warn!(value = %raw, "Ignoring invalid {}", ENV_IDLE_TIMEOUT_MINUTES),
            }
        }
        if let Some(raw) = lookup(ENV_SCROLLBACK_BYTES) {
            match raw.trim().parse::<usize>() {
                Ok(bytes) if bytes > 0 => self.scrollback.max_bytes = bytes,
                _ => warn!(value = %raw, "Ignoring invalid {}", ENV_SCROLLBACK_BYTES),
            }
        }
        if let Some(raw) = lookup(ENV_BIND) {
            match raw.trim().parse::<SocketAddr>() {
                Ok(addr) => self.server.bind = addr.to_string(),
                Err(_) => warn!(value = %raw, "Ignoring invalid {}", ENV_BIND),
            }
        }
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server
            .bind
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.server.bind))
    }

    pub fn host_adapter_config(&self) -> HostAdapterConfig {
        HostAdapterConfig {
            agent_program: self.host.agent_program.clone(),
            shell_program: self.host.shell_program.clone(),
            shell_root: self.host.shell_root.clone(),
            default_agent_options: self.host.agent_options.clone(),
        }
    }

    pub fn docker_defaults(&self) -> DockerDefaults {
        DockerDefaults {
            image_name: self.docker.image_name.clone(),
            image_tag: self.docker.image_tag.clone(),
            docker_program: self.docker.docker_program.clone(),
            agent_program: self.docker.agent_program.clone(),
            default_agent_options: self.docker.agent_options.clone(),
        }
    }

    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            idle_timeout_minutes: self.lifecycle.idle_timeout_minutes,
            shutdown_grace: Duration::from_secs(self.lifecycle.shutdown_grace_secs),
            ..LifecycleConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::domain::EnvironmentKind;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.bind, "127.0.0.1:3200");
        assert_eq!(config.server.outbox_capacity, 256);
        assert_eq!(config.lifecycle.idle_timeout_minutes, 30);
        assert_eq!(config.scrollback.max_bytes, 100 * 1024);
        assert_eq!(config.host.agent_program, "claude");
        assert_eq!(config.docker.image_name, "claude-code-sandboxed");
        assert_eq!(config.docker.image_tag, "latest");
        assert!(config.bind_addr().is_ok());
    }

    #[test]
    fn test_parse_partial_config() {
        let config: Config = toml::from_str(
            r#"
            [lifecycle]
            idle_timeout_minutes = 0

            [host]
            shell_root = "/srv/work"

            [host.agent_options]
            model = "sonnet"

            [[environment]]
            id = "sandbox"
            type = "DOCKER"
            auth_dir = "/tmp/auth"

            [[session]]
            id = "s1"
            working_dir = "/srv/work/app"
            environment_id = "sandbox"
            "#,
        )
        .unwrap();

        assert_eq!(config.lifecycle.idle_timeout_minutes, 0);
        assert_eq!(config.lifecycle.shutdown_grace_secs, 5);
        assert_eq!(config.server, ServerSettings::default());
        assert_eq!(config.host.agent_options.model.as_deref(), Some("sonnet"));
        assert_eq!(config.environment[0].kind, EnvironmentKind::Docker);
        assert_eq!(config.session[0].environment_id.as_deref(), Some("sandbox"));

        let host = config.host_adapter_config();
        assert_eq!(host.shell_root.as_deref(), Some(std::path::Path::new("/srv/work")));
        assert_eq!(config.lifecycle_config().idle_timeout_minutes, 0);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env_overrides(lookup(&[
            (ENV_IDLE_TIMEOUT_MINUTES, "45"),
            (ENV_SCROLLBACK_BYTES, "2048"),
            (ENV_BIND, "0.0.0.0:9000"),
        ]));
        assert_eq!(config.lifecycle.idle_timeout_minutes, 45);
        assert_eq!(config.scrollback.max_bytes, 2048);
        assert_eq!(config.server.bind, "0.0.0.0:9000");
    }

    #[test]
    fn test_invalid_env_overrides_keep_file_values() {
        let mut config = Config::default();
        config.apply_env_overrides(lookup(&[
            (ENV_IDLE_TIMEOUT_MINUTES, "soon"),
            (ENV_SCROLLBACK_BYTES, "0"),
            (ENV_BIND, "not-an-address"),
        ]));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_docker_defaults_follow_settings() {
        let mut config = Config::default();
        config.docker.image_tag = "v2".to_string();
        let defaults = config.docker_defaults();
        assert_eq!(defaults.image_tag, "v2");
        assert_eq!(defaults.docker_program, "docker");
    }
}

//! Per-section settings

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::adapter::{AgentOptions, DockerAdapterConfig};
use crate::lifecycle::DEFAULT_IDLE_TIMEOUT_MINUTES;
use crate::scrollback::DEFAULT_MAX_BYTES;

/// `[server]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address the websocket server listens on
    pub bind: String,
    /// Frames queued per viewer before sends count as dropped
    pub outbox_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3200".to_string(),
            outbox_capacity: 256,
        }
    }
}

/// `[lifecycle]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    /// Minutes without viewer activity before a session is suspended.
    /// 0 disables suspension; values below 5 are raised to 5.
    pub idle_timeout_minutes: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            idle_timeout_minutes: DEFAULT_IDLE_TIMEOUT_MINUTES,
            shutdown_grace_secs: 5,
        }
    }
}

/// `[scrollback]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrollbackSettings {
    pub max_bytes: usize,
}

impl Default for ScrollbackSettings {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

/// `[host]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    pub agent_program: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell_program: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell_root: Option<PathBuf>,
    pub agent_options: AgentOptions,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            agent_program: "claude".to_string(),
            shell_program: None,
            shell_root: None,
            agent_options: AgentOptions::default(),
        }
    }
}

/// `[docker]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerSettings {
    pub docker_program: String,
    pub image_name: String,
    pub image_tag: String,
    /// Agent binary inside the image
    pub agent_program: String,
    /// Advisory only; nothing enforces it
    pub max_concurrent_containers: usize,
    pub agent_options: AgentOptions,
}

impl Default for DockerSettings {
    fn default() -> Self {
        let base = DockerAdapterConfig::default();
        Self {
            docker_program: base.docker_program,
            image_name: base.image_name,
            image_tag: base.image_tag,
            agent_program: base.agent_program,
            max_concurrent_containers: 4,
            agent_options: base.default_agent_options,
        }
    }
}

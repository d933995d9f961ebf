use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Where a session's process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EnvironmentKind {
    /// Directly on the host machine
    Host,
    /// Inside a sandboxed docker container
    Docker,
    /// On a remote machine (not supported)
    Ssh,
}

impl fmt::Display for EnvironmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvironmentKind::Host => write!(f, "HOST"),
            EnvironmentKind::Docker => write!(f, "DOCKER"),
            EnvironmentKind::Ssh => write!(f, "SSH"),
        }
    }
}

/// A configured execution environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionEnvironment {
    /// Stable identifier, referenced by sessions
    pub id: String,

    /// Human readable name
    #[serde(default)]
    pub name: String,

    #[serde(rename = "type")]
    pub kind: EnvironmentKind,

    /// Sandbox image name (docker only; falls back to `[docker]` defaults)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,

    /// Sandbox image tag (docker only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_tag: Option<String>,

    /// Per-environment directory holding the agent's credentials (docker only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_dir: Option<PathBuf>,
}

impl ExecutionEnvironment {
    /// The implicit host environment used when a session names none
    pub fn host(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: "Host".to_string(),
            kind: EnvironmentKind::Host,
            image_name: None,
            image_tag: None,
            auth_dir: None,
        }
    }

    pub fn docker(id: impl Into<String>, auth_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            name: "Docker".to_string(),
            kind: EnvironmentKind::Docker,
            image_name: None,
            image_tag: None,
            auth_dir: Some(auth_dir.into()),
        }
    }
}

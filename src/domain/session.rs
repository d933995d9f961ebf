use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A stored session: where it runs and how to pick it back up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,

    pub working_dir: PathBuf,

    /// Execution environment id; `None` means the default (host) environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_id: Option<String>,

    /// Token passed to the agent to continue an earlier conversation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,

    /// Agent-side conversation id, as last detected in the output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,

    /// Prompt sent once, on the first start only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_prompt: Option<String>,

    /// Set after the first successful start
    #[serde(default)]
    pub started: bool,
}

impl SessionRecord {
    pub fn new(id: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            working_dir: working_dir.into(),
            environment_id: None,
            resume_token: None,
            agent_session_id: None,
            initial_prompt: None,
            started: false,
        }
    }

    pub fn in_environment(mut self, environment_id: impl Into<String>) -> Self {
        self.environment_id = Some(environment_id.into());
        self
    }

    pub fn with_initial_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.initial_prompt = Some(prompt.into());
        self
    }

    /// Prompt to send on the next start, if this is the first one
    pub fn pending_prompt(&self) -> Option<&str> {
        if self.started {
            None
        } else {
            self.initial_prompt.as_deref()
        }
    }
}

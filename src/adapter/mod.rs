//! Execution environment adapters.
//!
//! A session's interactive process runs behind an [`EnvironmentAdapter`]:
//!
//! - **[`HostAdapter`]** - runs the agent CLI (or a plain shell) in a PTY on
//!   the host machine.
//! - **[`DockerAdapter`]** - runs the agent inside a locked-down container,
//!   one adapter per configured docker environment.
//! - **[`AdapterFactory`]** - maps an [`ExecutionEnvironment`] to its adapter
//!   and caches the instances.
//!
//! Every adapter reports what happens to its sessions as [`AdapterEvent`]s on
//! a channel handed in at construction.
//!
//! [`ExecutionEnvironment`]: crate::domain::ExecutionEnvironment

mod detect;
mod docker;
mod factory;
mod host;
mod options;
mod pty;
mod table;

pub use detect::{extract_agent_session_id, strip_ansi_codes};
pub use docker::{
    classify_exit, classify_output, DockerAdapter, DockerAdapterConfig, MountContext,
};
pub use factory::{AdapterFactory, DockerDefaults};
pub use host::{HostAdapter, HostAdapterConfig};
pub use options::{
    build_agent_args, is_valid_env_key, redact_args, sanitize_env, AgentOptions,
    NESTED_AGENT_MARKER,
};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::domain::{EnvironmentKind, ExitInfo, TerminalSize};
use crate::error::SessionError;

/// Pause between destroying and re-creating a session on restart
pub const RESTART_DELAY: Duration = Duration::from_millis(500);

/// Time the agent gets to boot before the initial prompt is typed in
pub const PROMPT_WARMUP_DELAY: Duration = Duration::from_secs(3);

/// Per-call knobs for [`EnvironmentAdapter::create_session`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateSessionOptions {
    /// Continue an earlier agent conversation
    pub resume_token: Option<String>,
    /// Run a plain shell instead of the agent
    pub shell_mode: bool,
    /// Initial terminal size (80x24 when unset)
    pub size: Option<TerminalSize>,
    /// Agent flags layered over the adapter's defaults
    pub agent_options: Option<AgentOptions>,
    /// Extra environment variables for the process
    pub env: HashMap<String, String>,
}

impl CreateSessionOptions {
    pub fn resume(token: impl Into<String>) -> Self {
        Self {
            resume_token: Some(token.into()),
            ..Self::default()
        }
    }

    pub fn shell() -> Self {
        Self {
            shell_mode: true,
            ..Self::default()
        }
    }
}

/// What happened to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEventKind {
    Data(String),
    Exit(ExitInfo),
    Error(String),
    AgentSessionIdDetected(String),
}

impl AdapterEventKind {
    /// Handler key used by the connection manager
    pub fn name(&self) -> &'static str {
        match self {
            AdapterEventKind::Data(_) => "data",
            AdapterEventKind::Exit(_) => "exit",
            AdapterEventKind::Error(_) => "error",
            AdapterEventKind::AgentSessionIdDetected(_) => "agentSessionIdDetected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterEvent {
    pub session_id: String,
    pub kind: AdapterEventKind,
}

/// Cloneable sending half used by adapters and their PTY threads
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<AdapterEvent>,
}

impl EventEmitter {
    pub fn new(tx: mpsc::UnboundedSender<AdapterEvent>) -> Self {
        Self { tx }
    }

    /// Emitter plus the receiving end, for wiring and tests
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AdapterEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, session_id: &str, kind: AdapterEventKind) {
        let event = AdapterEvent {
            session_id: session_id.to_string(),
            kind,
        };
        if self.tx.send(event).is_err() {
            debug!(session_id = %session_id, "Adapter event dropped, receiver gone");
        }
    }

    pub fn data(&self, session_id: &str, data: &str) {
        self.emit(session_id, AdapterEventKind::Data(data.to_string()));
    }

    pub fn exit(&self, session_id: &str, info: ExitInfo) {
        self.emit(session_id, AdapterEventKind::Exit(info));
    }

    pub fn error(&self, session_id: &str, message: impl Into<String>) {
        self.emit(session_id, AdapterEventKind::Error(message.into()));
    }

    pub fn agent_session_id(&self, session_id: &str, agent_session_id: impl Into<String>) {
        self.emit(
            session_id,
            AdapterEventKind::AgentSessionIdDetected(agent_session_id.into()),
        );
    }
}

/// A backend that can host interactive session processes.
///
/// `write`, `resize` and `destroy_session` on an unknown session id are
/// no-ops. `destroy_session` is idempotent.
#[async_trait]
pub trait EnvironmentAdapter: Send + Sync {
    fn kind(&self) -> EnvironmentKind;

    /// Spawn the session's process.
    ///
    /// Fails with a validation error when `working_dir` is missing, and with
    /// [`SessionError::ConcurrentCreation`] when a create for the same id is
    /// already in flight. No partial state is left behind on failure.
    async fn create_session(
        &self,
        session_id: &str,
        working_dir: &Path,
        initial_prompt: Option<&str>,
        options: CreateSessionOptions,
    ) -> Result<(), SessionError>;

    /// Forward raw input to the process
    fn write(&self, session_id: &str, data: &str);

    fn resize(&self, session_id: &str, size: TerminalSize);

    async fn destroy_session(&self, session_id: &str);

    /// Destroy, wait [`RESTART_DELAY`], then re-create with the same
    /// parameters. Skipped if the session is re-created or destroyed by
    /// someone else in the meantime.
    async fn restart_session(&self, session_id: &str);

    fn has_session(&self, session_id: &str) -> bool;

    fn working_dir(&self, session_id: &str) -> Option<PathBuf>;

    /// Agent conversation id detected in the session's output, if any
    fn agent_session_id(&self, session_id: &str) -> Option<String>;

    fn session_ids(&self) -> Vec<String>;
}

/// Check that a working directory exists and is a directory
pub(crate) fn validate_working_dir(path: &Path) -> Result<PathBuf, SessionError> {
    let metadata = std::fs::metadata(path)
        .map_err(|_| SessionError::WorkingDirMissing(path.to_path_buf()))?;
    if !metadata.is_dir() {
        return Err(SessionError::WorkingDirNotDirectory(path.to_path_buf()));
    }
    Ok(std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()))
}

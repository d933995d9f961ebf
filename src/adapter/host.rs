//! Sessions running directly on the host machine

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::detect::SessionIdDetector;
use super::options::{build_agent_args, redact_args, sanitize_env, AgentOptions};
use super::pty::{PtyProcess, SpawnSpec};
use super::table::SessionTable;
use super::{
    validate_working_dir, CreateSessionOptions, EnvironmentAdapter, EventEmitter,
    PROMPT_WARMUP_DELAY, RESTART_DELAY,
};
use crate::domain::{EnvironmentKind, TerminalSize};
use crate::error::SessionError;

/// Settings for [`HostAdapter`]
#[derive(Debug, Clone)]
pub struct HostAdapterConfig {
    /// Agent CLI binary
    pub agent_program: String,
    /// Shell for shell-mode sessions; `$SHELL` (or bash) when unset
    pub shell_program: Option<String>,
    /// Shell sessions may only start inside this directory
    pub shell_root: Option<PathBuf>,
    pub default_agent_options: AgentOptions,
}

impl Default for HostAdapterConfig {
    fn default() -> Self {
        Self {
            agent_program: "claude".to_string(),
            shell_program: None,
            shell_root: None,
            default_agent_options: AgentOptions::default(),
        }
    }
}

impl HostAdapterConfig {
    fn shell(&self) -> String {
        if let Some(shell) = &self.shell_program {
            return shell.clone();
        }
        if cfg!(windows) {
            "powershell.exe".to_string()
        } else {
            std::env::var("SHELL").unwrap_or_else(|_| "bash".to_string())
        }
    }
}

struct AgentSession {
    pty: PtyProcess,
    working_dir: PathBuf,
    initial_prompt: Option<String>,
    options: CreateSessionOptions,
    detector: Arc<SessionIdDetector>,
}

struct ShellSession {
    pty: PtyProcess,
    working_dir: PathBuf,
    options: CreateSessionOptions,
}

/// One host session, backed by either the agent CLI or a plain shell
enum HostSession {
    Agent(AgentSession),
    Shell(ShellSession),
}

impl HostSession {
    fn pty(&self) -> &PtyProcess {
        match self {
            HostSession::Agent(s) => &s.pty,
            HostSession::Shell(s) => &s.pty,
        }
    }

    fn working_dir(&self) -> &Path {
        match self {
            HostSession::Agent(s) => &s.working_dir,
            HostSession::Shell(s) => &s.working_dir,
        }
    }

    /// Parameters needed to start the same session again
    fn recreate_params(&self) -> (PathBuf, Option<String>, CreateSessionOptions) {
        match self {
            HostSession::Agent(s) => (
                s.working_dir.clone(),
                s.initial_prompt.clone(),
                s.options.clone(),
            ),
            HostSession::Shell(s) => (s.working_dir.clone(), None, s.options.clone()),
        }
    }
}

/// Runs agent and shell sessions in host PTYs
pub struct HostAdapter {
    config: HostAdapterConfig,
    sessions: Arc<SessionTable<HostSession>>,
    events: EventEmitter,
}

impl HostAdapter {
    pub fn new(config: HostAdapterConfig, events: EventEmitter) -> Self {
        Self {
            config,
            sessions: Arc::new(SessionTable::new()),
            events,
        }
    }

    /// Directory a shell session may start in: existing, and inside the
    /// configured root when there is one
    fn confine_shell_dir(&self, dir: &Path) -> Result<PathBuf, SessionError> {
        let Some(root) = &self.config.shell_root else {
            return Ok(dir.to_path_buf());
        };
        let root = std::fs::canonicalize(root).map_err(|e| {
            SessionError::Validation(format!(
                "shell root {} is not accessible: {e}",
                root.display()
            ))
        })?;
        if dir.starts_with(&root) {
            Ok(dir.to_path_buf())
        } else {
            Err(SessionError::Validation(format!(
                "{} is outside the allowed directory {}",
                dir.display(),
                root.display()
            )))
        }
    }

    fn spawn_spec(
        &self,
        session_id: &str,
        cwd: &Path,
        options: &CreateSessionOptions,
    ) -> SpawnSpec {
        let mut spec = if options.shell_mode {
            SpawnSpec::new(self.config.shell())
        } else {
            let agent_options = match &options.agent_options {
                Some(overrides) => self.config.default_agent_options.merged_with(overrides),
                None => self.config.default_agent_options.clone(),
            };
            let mut spec = SpawnSpec::new(&self.config.agent_program);
            spec.args = build_agent_args(&agent_options, options.resume_token.as_deref());
            spec
        };
        spec.cwd = Some(cwd.to_path_buf());
        spec.env = sanitize_env(&options.env);
        spec.size = options.size.unwrap_or_default();

        info!(
            session_id = %session_id,
            program = %spec.program,
            args = ?redact_args(&spec.args),
            cwd = %cwd.display(),
            shell = options.shell_mode,
            "Spawning host session"
        );
        spec
    }

    fn schedule_initial_prompt(&self, session_id: &str, generation: u64, prompt: String) {
        let sessions = self.sessions.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(PROMPT_WARMUP_DELAY).await;
            match sessions.get_current(&session_id, generation) {
                Some(session) => {
                    if let Err(e) = session.pty().write(&format!("{prompt}\n")) {
                        warn!(session_id = %session_id, error = %e, "Failed to send initial prompt");
                    }
                }
                None => debug!(session_id = %session_id, "Session gone before initial prompt"),
            }
        });
    }
}

#[async_trait]
impl EnvironmentAdapter for HostAdapter {
    fn kind(&self) -> EnvironmentKind {
        EnvironmentKind::Host
    }

    async fn create_session(
        &self,
        session_id: &str,
        working_dir: &Path,
        initial_prompt: Option<&str>,
        options: CreateSessionOptions,
    ) -> Result<(), SessionError> {
        let mut cwd = validate_working_dir(working_dir)?;
        if options.shell_mode {
            cwd = self.confine_shell_dir(&cwd)?;
        }

        let reservation = self.sessions.reserve(session_id)?;
        let generation = reservation.generation;
        if let Some(previous) = reservation.previous {
            info!(session_id = %session_id, "Replacing running session");
            previous.pty().kill();
        }

        let shell_mode = options.shell_mode;
        let spec = self.spawn_spec(session_id, &cwd, &options);
        let detector = Arc::new(SessionIdDetector::new());

        let on_output = {
            let events = self.events.clone();
            let session_id = session_id.to_string();
            let detector = (!shell_mode).then(|| detector.clone());
            move |chunk: &str| {
                events.data(&session_id, chunk);
                if let Some(id) = detector.as_ref().and_then(|d| d.scan(chunk)) {
                    info!(session_id = %session_id, agent_session_id = %id, "Detected agent session id");
                    events.agent_session_id(&session_id, id);
                }
            }
        };
        let on_exit = {
            let events = self.events.clone();
            let sessions = self.sessions.clone();
            let session_id = session_id.to_string();
            move |info: crate::domain::ExitInfo| {
                if sessions.finish(&session_id, generation) {
                    info!(session_id = %session_id, exit_code = info.exit_code, signal = ?info.signal, "Host session exited");
                    events.exit(&session_id, info);
                } else {
                    debug!(session_id = %session_id, "Ignoring exit of superseded process");
                }
            }
        };

        let spawned = tokio::task::spawn_blocking(move || PtyProcess::spawn(spec, on_output, on_exit))
            .await
            .map_err(|e| SessionError::spawn(session_id, e))
            .and_then(|r| r.map_err(|e| SessionError::spawn(session_id, format!("{e:#}"))));

        let pty = match spawned {
            Ok(pty) => pty,
            Err(e) => {
                self.sessions.abandon(session_id, generation);
                error!(session_id = %session_id, error = %e, "Failed to start host session");
                self.events.error(session_id, e.to_string());
                return Err(e);
            }
        };

        let session = if shell_mode {
            HostSession::Shell(ShellSession {
                pty,
                working_dir: cwd,
                options,
            })
        } else {
            HostSession::Agent(AgentSession {
                pty,
                working_dir: cwd,
                initial_prompt: initial_prompt.map(str::to_string),
                options,
                detector,
            })
        };

        if let Err(orphan) = self.sessions.install(session_id, generation, Arc::new(session)) {
            warn!(session_id = %session_id, "Session superseded while starting");
            orphan.pty().kill();
            return Ok(());
        }

        if let Some(prompt) = initial_prompt.filter(|p| !p.is_empty() && !shell_mode) {
            self.schedule_initial_prompt(session_id, generation, prompt.to_string());
        }
        Ok(())
    }

    fn write(&self, session_id: &str, data: &str) {
        let Some(session) = self.sessions.get(session_id) else {
            return;
        };
        if let Err(e) = session.pty().write(data) {
            warn!(session_id = %session_id, error = %e, "Failed to write to session");
        }
    }

    fn resize(&self, session_id: &str, size: TerminalSize) {
        let Some(session) = self.sessions.get(session_id) else {
            return;
        };
        if let Err(e) = session.pty().resize(size) {
            warn!(session_id = %session_id, error = %e, "Failed to resize session");
        }
    }

    async fn destroy_session(&self, session_id: &str) {
        let Some(session) = self.sessions.remove(session_id) else {
            return;
        };
        info!(session_id = %session_id, pid = ?session.pty().pid(), "Destroying host session");
        let _ = tokio::task::spawn_blocking(move || session.pty().kill()).await;
    }

    async fn restart_session(&self, session_id: &str) {
        let Some(session) = self.sessions.get(session_id) else {
            warn!(session_id = %session_id, "Cannot restart unknown session");
            return;
        };
        let (working_dir, initial_prompt, options) = session.recreate_params();
        drop(session);

        self.destroy_session(session_id).await;
        let generation = self.sessions.generation(session_id);
        tokio::time::sleep(RESTART_DELAY).await;

        if self.sessions.generation(session_id) != generation {
            info!(session_id = %session_id, "Restart superseded, skipping re-create");
            return;
        }
        if let Err(e) = self
            .create_session(session_id, &working_dir, initial_prompt.as_deref(), options)
            .await
        {
            error!(session_id = %session_id, error = %e, "Failed to restart session");
            self.events.error(session_id, format!("restart failed: {e}"));
        }
    }

    fn has_session(&self, session_id: &str) -> bool {
        self.sessions.contains(session_id)
    }

    fn working_dir(&self, session_id: &str) -> Option<PathBuf> {
        self.sessions
            .get(session_id)
            .map(|s| s.working_dir().to_path_buf())
    }

    fn agent_session_id(&self, session_id: &str) -> Option<String> {
        match self.sessions.get(session_id).as_deref() {
            Some(HostSession::Agent(s)) => s.detector.detected(),
            _ => None,
        }
    }

    fn session_ids(&self) -> Vec<String> {
        self.sessions.ids()
    }
}

impl Drop for HostAdapter {
    fn drop(&mut self) {
        for (session_id, session) in self.sessions.drain() {
            debug!(session_id = %session_id, "Killing session on adapter drop");
            session.pty().kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter_with_root(root: Option<PathBuf>) -> HostAdapter {
        let (events, _rx) = EventEmitter::channel();
        HostAdapter::new(
            HostAdapterConfig {
                shell_root: root,
                ..HostAdapterConfig::default()
            },
            events,
        )
    }

    #[tokio::test]
    async fn test_create_rejects_missing_dir_without_state() {
        let adapter = adapter_with_root(None);
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");

        let err = adapter
            .create_session("s1", &missing, None, CreateSessionOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert!(!adapter.has_session("s1"));
        assert!(adapter.session_ids().is_empty());
        // no lingering reservation
        assert_eq!(adapter.sessions.generation("s1"), 0);
    }

    #[tokio::test]
    async fn test_shell_dir_outside_root_rejected() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let adapter = adapter_with_root(Some(root.path().to_path_buf()));

        let err = adapter
            .create_session("s1-terminal", outside.path(), None, CreateSessionOptions::shell())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));
        assert!(!adapter.has_session("s1-terminal"));
    }

    #[test]
    fn test_confine_shell_dir_accepts_subdirectory() {
        let root = tempfile::tempdir().unwrap();
        let sub = root.path().join("project");
        std::fs::create_dir(&sub).unwrap();
        let adapter = adapter_with_root(Some(root.path().to_path_buf()));

        let sub = std::fs::canonicalize(&sub).unwrap();
        assert_eq!(adapter.confine_shell_dir(&sub).unwrap(), sub);
    }

    #[tokio::test]
    async fn test_unknown_session_operations_are_noops() {
        let adapter = adapter_with_root(None);
        adapter.write("ghost", "ls\n");
        adapter.resize("ghost", TerminalSize::new(100, 30));
        adapter.destroy_session("ghost").await;
        adapter.destroy_session("ghost").await;
        adapter.restart_session("ghost").await;
        assert!(!adapter.has_session("ghost"));
        assert_eq!(adapter.working_dir("ghost"), None);
        assert_eq!(adapter.agent_session_id("ghost"), None);
    }

    #[test]
    fn test_agent_spawn_spec_merges_options() {
        let adapter = HostAdapter::new(
            HostAdapterConfig {
                agent_program: "agent-cli".into(),
                default_agent_options: AgentOptions {
                    model: Some("sonnet".into()),
                    ..AgentOptions::default()
                },
                ..HostAdapterConfig::default()
            },
            EventEmitter::channel().0,
        );
        let options = CreateSessionOptions {
            resume_token: Some("tok-1234".into()),
            agent_options: Some(AgentOptions {
                permission_mode: Some("plan".into()),
                ..AgentOptions::default()
            }),
            ..CreateSessionOptions::default()
        };
        let spec = adapter.spawn_spec("s1", Path::new("/tmp"), &options);
        assert_eq!(spec.program, "agent-cli");
        assert_eq!(
            spec.args,
            vec!["--resume", "tok-1234", "--model", "sonnet", "--permission-mode", "plan"]
        );
        assert_eq!(spec.size, TerminalSize::default());
    }
}

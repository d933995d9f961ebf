//! Sessions running inside disposable docker containers
//!
//! Each agent session gets its own `docker run -it --rm` container with the
//! working directory mounted at `/workspace`. A shell session named
//! `<parent>-terminal` attaches to the parent's container with `docker exec`.

mod args;
mod classify;
mod cli;

pub use args::MountContext;
pub use classify::{classify_exit, classify_output};

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use self::args::{build_exec_args, build_run_args, container_name, write_env_file};
use self::classify::StartupCapture;
use self::cli::DockerCli;
use super::detect::SessionIdDetector;
use super::options::{redact_args, sanitize_env, AgentOptions};
use super::pty::{PtyProcess, SpawnSpec};
use super::table::SessionTable;
use super::{
    validate_working_dir, CreateSessionOptions, EnvironmentAdapter, EventEmitter,
    PROMPT_WARMUP_DELAY, RESTART_DELAY,
};
use crate::domain::{EnvironmentKind, ExitInfo, TerminalSize};
use crate::error::SessionError;

/// Suffix that marks a shell session attached to an agent session
const SHELL_SUFFIX: &str = "-terminal";

/// Shell started by `docker exec`
const CONTAINER_SHELL: &str = "bash";

/// Container startup swallows resizes sent before the first output
const DEFERRED_RESIZE_DELAY: Duration = Duration::from_secs(1);

/// Settings for one docker-backed environment
#[derive(Debug, Clone)]
pub struct DockerAdapterConfig {
    pub environment_id: String,
    pub image_name: String,
    pub image_tag: String,
    /// Per-environment agent state mounted into the container
    pub auth_dir: PathBuf,
    pub docker_program: String,
    /// Entrypoint inside the image
    pub agent_program: String,
    pub default_agent_options: AgentOptions,
}

impl Default for DockerAdapterConfig {
    fn default() -> Self {
        Self {
            environment_id: String::new(),
            image_name: "claude-code-sandboxed".to_string(),
            image_tag: "latest".to_string(),
            auth_dir: PathBuf::new(),
            docker_program: "docker".to_string(),
            agent_program: "claude".to_string(),
            default_agent_options: AgentOptions::default(),
        }
    }
}

struct DockerSession {
    pty: PtyProcess,
    working_dir: PathBuf,
    container_name: String,
    /// Attached with `docker exec`; the container belongs to another session
    shell_mode: bool,
    initial_prompt: Option<String>,
    options: CreateSessionOptions,
    detector: Arc<SessionIdDetector>,
    last_size: Arc<Mutex<Option<TerminalSize>>>,
    /// Agent sessions only
    capture: Option<Arc<Mutex<StartupCapture>>>,
}

impl DockerSession {
    /// Kill the process, marking the exit as one we asked for
    fn stop(&self) {
        if let Some(capture) = &self.capture {
            capture
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .mark_stop_requested();
        }
        self.pty.kill();
    }
}

/// Runs agent sessions in containers of one docker environment
pub struct DockerAdapter {
    config: DockerAdapterConfig,
    sessions: Arc<SessionTable<DockerSession>>,
    events: EventEmitter,
    cli: DockerCli,
    mounts: Option<MountContext>,
}

impl DockerAdapter {
    pub fn new(config: DockerAdapterConfig, events: EventEmitter) -> Self {
        let cli = DockerCli::new(&config.docker_program);
        Self {
            config,
            sessions: Arc::new(SessionTable::new()),
            events,
            cli,
            mounts: None,
        }
    }

    /// Use fixed host facts instead of inspecting the current user
    pub fn with_mount_context(mut self, mounts: MountContext) -> Self {
        self.mounts = Some(mounts);
        self
    }

    pub fn config(&self) -> &DockerAdapterConfig {
        &self.config
    }

    /// Container running the given agent session
    pub fn container_for(&self, session_id: &str) -> Option<String> {
        self.sessions.get(session_id).map(|s| s.container_name.clone())
    }

    async fn create_shell_session(
        &self,
        session_id: &str,
        cwd: PathBuf,
        options: CreateSessionOptions,
    ) -> Result<(), SessionError> {
        let parent_id = session_id.strip_suffix(SHELL_SUFFIX).unwrap_or(session_id);
        let container = match self.sessions.get(parent_id) {
            Some(parent) if !parent.shell_mode => parent.container_name.clone(),
            _ => {
                return Err(SessionError::Validation(format!(
                    "no running container for session {parent_id}; start the agent session first"
                )));
            }
        };
        if !self.cli.is_running(&container).await {
            return Err(SessionError::Validation(format!(
                "container {container} for session {parent_id} is not running"
            )));
        }

        let reservation = self.sessions.reserve(session_id)?;
        let generation = reservation.generation;
        if let Some(previous) = reservation.previous {
            previous.stop();
        }

        let mut spec = SpawnSpec::new(self.cli.program());
        spec.args = build_exec_args(&container, CONTAINER_SHELL);
        spec.size = options.size.unwrap_or_default();
        info!(session_id = %session_id, container = %container, "Attaching shell to container");

        let on_output = {
            let events = self.events.clone();
            let session_id = session_id.to_string();
            move |chunk: &str| events.data(&session_id, chunk)
        };
        let on_exit = {
            let events = self.events.clone();
            let sessions = self.sessions.clone();
            let session_id = session_id.to_string();
            move |info: ExitInfo| {
                if sessions.finish(&session_id, generation) {
                    events.exit(&session_id, info);
                }
            }
        };

        let pty = match self.spawn_pty(session_id, spec, on_output, on_exit).await {
            Ok(pty) => pty,
            Err(e) => {
                self.sessions.abandon(session_id, generation);
                self.events.error(session_id, e.to_string());
                return Err(e);
            }
        };

        let session = DockerSession {
            pty,
            working_dir: cwd,
            container_name: container,
            shell_mode: true,
            initial_prompt: None,
            options,
            detector: Arc::new(SessionIdDetector::new()),
            last_size: Arc::new(Mutex::new(None)),
            capture: None,
        };
        if let Err(orphan) = self.sessions.install(session_id, generation, Arc::new(session)) {
            orphan.stop();
        }
        Ok(())
    }

    async fn create_agent_session(
        &self,
        session_id: &str,
        cwd: PathBuf,
        initial_prompt: Option<&str>,
        options: CreateSessionOptions,
    ) -> Result<(), SessionError> {
        let reservation = self.sessions.reserve(session_id)?;
        let generation = reservation.generation;
        if let Some(previous) = reservation.previous {
            previous.stop();
            if !previous.shell_mode {
                self.cli.stop(&previous.container_name).await;
            }
        }

        let env_file = match write_env_file(&sanitize_env(&options.env)) {
            Ok(path) => path,
            Err(e) => {
                self.sessions.abandon(session_id, generation);
                return Err(SessionError::spawn(session_id, format!("{e:#}")));
            }
        };

        let container = container_name(&self.config.environment_id);
        let mounts = self.mounts.clone().unwrap_or_else(MountContext::from_host);
        let mut spec = SpawnSpec::new(self.cli.program());
        spec.args = build_run_args(
            &self.config,
            &container,
            &cwd,
            &options,
            &mounts,
            env_file.as_deref(),
        );
        spec.size = options.size.unwrap_or_default();
        info!(
            session_id = %session_id,
            container = %container,
            args = ?redact_args(&spec.args),
            env_keys = ?options.env.keys().collect::<Vec<_>>(),
            "Starting container session"
        );

        let runtime = tokio::runtime::Handle::current();
        let capture = Arc::new(Mutex::new(StartupCapture::default()));
        let detector = Arc::new(SessionIdDetector::new());
        let last_size = Arc::new(Mutex::new(options.size));

        let on_output = {
            let events = self.events.clone();
            let sessions = self.sessions.clone();
            let session_id = session_id.to_string();
            let capture = capture.clone();
            let detector = detector.clone();
            let runtime = runtime.clone();
            move |chunk: &str| {
                let first = capture
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .record(chunk);
                if first {
                    schedule_deferred_resize(&runtime, sessions.clone(), &session_id, generation);
                }
                if let Some(id) = detector.scan(chunk) {
                    info!(session_id = %session_id, agent_session_id = %id, "Detected agent session id");
                    events.agent_session_id(&session_id, id);
                }
                events.data(&session_id, chunk);
            }
        };
        let on_exit = {
            let events = self.events.clone();
            let sessions = self.sessions.clone();
            let session_id = session_id.to_string();
            let cli = self.cli.clone();
            let container = container.clone();
            let env_file = env_file.clone();
            let capture = capture.clone();
            move |info: ExitInfo| {
                if let Some(path) = &env_file {
                    if let Err(e) = std::fs::remove_file(path) {
                        debug!(path = %path.display(), error = %e, "Env file already gone");
                    }
                }
                if sessions.finish(&session_id, generation) {
                    let failure = capture
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .classify(&info);
                    if let Some(err) = failure {
                        warn!(session_id = %session_id, error = %err, "Container failed to start");
                        events.error(&session_id, err.user_message());
                    }
                    info!(session_id = %session_id, exit_code = info.exit_code, "Container session exited");
                    events.exit(&session_id, info);
                } else {
                    debug!(session_id = %session_id, container = %container, "Ignoring exit of superseded container");
                }
                runtime.spawn(async move { cli.stop(&container).await });
            }
        };

        let pty = match self.spawn_pty(session_id, spec, on_output, on_exit).await {
            Ok(pty) => pty,
            Err(e) => {
                self.sessions.abandon(session_id, generation);
                if let Some(path) = &env_file {
                    let _ = std::fs::remove_file(path);
                }
                error!(session_id = %session_id, error = %e, "Failed to start docker session");
                self.events.error(session_id, e.to_string());
                return Err(e);
            }
        };

        let session = DockerSession {
            pty,
            working_dir: cwd,
            container_name: container.clone(),
            shell_mode: false,
            initial_prompt: initial_prompt.map(str::to_string),
            options,
            detector,
            last_size,
            capture: Some(capture.clone()),
        };
        if let Err(orphan) = self.sessions.install(session_id, generation, Arc::new(session)) {
            warn!(session_id = %session_id, "Session superseded while starting");
            orphan.stop();
            self.cli.stop(&container).await;
            return Ok(());
        }

        let sessions = self.sessions.clone();
        let ready = self
            .cli
            .wait_until_ready(&container, || sessions.is_current(session_id, generation))
            .await;
        if let Err(e) = ready {
            let failure = {
                let capture = capture.lock().unwrap_or_else(|e| e.into_inner());
                if capture.stop_requested() {
                    info!(session_id = %session_id, "Session stopped during startup");
                    return Ok(());
                }
                capture.startup_error(format!("{e:#}; check the docker logs"))
            };
            error!(session_id = %session_id, error = %failure, "Container never became ready");
            if self.sessions.is_current(session_id, generation) {
                self.destroy_session(session_id).await;
            }
            return Err(SessionError::Startup(failure));
        }

        capture
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .mark_ready();

        if let Some(prompt) = initial_prompt.filter(|p| !p.is_empty()) {
            self.schedule_initial_prompt(session_id, generation, prompt.to_string());
        }
        Ok(())
    }

    async fn spawn_pty<O, E>(
        &self,
        session_id: &str,
        spec: SpawnSpec,
        on_output: O,
        on_exit: E,
    ) -> Result<PtyProcess, SessionError>
    where
        O: FnMut(&str) + Send + 'static,
        E: FnOnce(ExitInfo) + Send + 'static,
    {
        tokio::task::spawn_blocking(move || PtyProcess::spawn(spec, on_output, on_exit))
            .await
            .map_err(|e| SessionError::spawn(session_id, e))?
            .map_err(|e| SessionError::spawn(session_id, format!("{e:#}")))
    }

    fn schedule_initial_prompt(&self, session_id: &str, generation: u64, prompt: String) {
        let sessions = self.sessions.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(PROMPT_WARMUP_DELAY).await;
            match sessions.get_current(&session_id, generation) {
                Some(session) => {
                    if let Err(e) = session.pty.write(&format!("{prompt}\n")) {
                        warn!(session_id = %session_id, error = %e, "Failed to send initial prompt");
                    }
                }
                None => debug!(session_id = %session_id, "Session gone before initial prompt"),
            }
        });
    }
}

fn schedule_deferred_resize(
    runtime: &tokio::runtime::Handle,
    sessions: Arc<SessionTable<DockerSession>>,
    session_id: &str,
    generation: u64,
) {
    let session_id = session_id.to_string();
    runtime.spawn(async move {
        tokio::time::sleep(DEFERRED_RESIZE_DELAY).await;
        let Some(session) = sessions.get_current(&session_id, generation) else {
            return;
        };
        let size = *session.last_size.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(size) = size {
            debug!(session_id = %session_id, cols = size.cols, rows = size.rows, "Re-applying terminal size");
            if let Err(e) = session.pty.resize(size) {
                warn!(session_id = %session_id, error = %e, "Deferred resize failed");
            }
        }
    });
}

#[async_trait]
impl EnvironmentAdapter for DockerAdapter {
    fn kind(&self) -> EnvironmentKind {
        EnvironmentKind::Docker
    }

    async fn create_session(
        &self,
        session_id: &str,
        working_dir: &Path,
        initial_prompt: Option<&str>,
        options: CreateSessionOptions,
    ) -> Result<(), SessionError> {
        if self.sessions.contains(session_id) {
            info!(session_id = %session_id, "Reusing running container session");
            return Ok(());
        }
        let cwd = validate_working_dir(working_dir)?;

        if options.shell_mode {
            self.create_shell_session(session_id, cwd, options).await
        } else {
            self.create_agent_session(session_id, cwd, initial_prompt, options)
                .await
        }
    }

    fn write(&self, session_id: &str, data: &str) {
        let Some(session) = self.sessions.get(session_id) else {
            return;
        };
        if let Err(e) = session.pty.write(data) {
            warn!(session_id = %session_id, error = %e, "Failed to write to container session");
        }
    }

    fn resize(&self, session_id: &str, size: TerminalSize) {
        let Some(session) = self.sessions.get(session_id) else {
            return;
        };
        *session.last_size.lock().unwrap_or_else(|e| e.into_inner()) = Some(size);
        if let Err(e) = session.pty.resize(size) {
            warn!(session_id = %session_id, error = %e, "Failed to resize container session");
        }
    }

    async fn destroy_session(&self, session_id: &str) {
        let Some(session) = self.sessions.remove(session_id) else {
            return;
        };
        info!(session_id = %session_id, container = %session.container_name, "Destroying container session");
        let container = session.container_name.clone();
        let shell_mode = session.shell_mode;
        let _ = tokio::task::spawn_blocking(move || session.stop()).await;
        if !shell_mode {
            self.cli.stop(&container).await;
        }
    }

    async fn restart_session(&self, session_id: &str) {
        let Some(session) = self.sessions.get(session_id) else {
            warn!(session_id = %session_id, "Cannot restart unknown session");
            return;
        };
        let working_dir = session.working_dir.clone();
        let initial_prompt = session.initial_prompt.clone();
        let options = session.options.clone();
        let container = (!session.shell_mode).then(|| session.container_name.clone());
        drop(session);

        self.destroy_session(session_id).await;
        let generation = self.sessions.generation(session_id);
        if let Some(container) = &container {
            self.cli.wait_exit(container).await;
        }
        tokio::time::sleep(RESTART_DELAY).await;

        if self.sessions.generation(session_id) != generation {
            info!(session_id = %session_id, "Restart superseded, skipping re-create");
            return;
        }
        if let Err(e) = self
            .create_session(session_id, &working_dir, initial_prompt.as_deref(), options)
            .await
        {
            error!(session_id = %session_id, error = %e, "Failed to restart container session");
            self.events.error(session_id, format!("restart failed: {e}"));
        }
    }

    fn has_session(&self, session_id: &str) -> bool {
        self.sessions.contains(session_id)
    }

    fn working_dir(&self, session_id: &str) -> Option<PathBuf> {
        self.sessions.get(session_id).map(|s| s.working_dir.clone())
    }

    fn agent_session_id(&self, session_id: &str) -> Option<String> {
        self.sessions
            .get(session_id)
            .filter(|s| !s.shell_mode)
            .and_then(|s| s.detector.detected())
    }

    fn session_ids(&self) -> Vec<String> {
        self.sessions.ids()
    }
}

impl Drop for DockerAdapter {
    fn drop(&mut self) {
        let runtime = tokio::runtime::Handle::try_current().ok();
        for (session_id, session) in self.sessions.drain() {
            debug!(session_id = %session_id, "Killing container session on adapter drop");
            session.stop();
            if let (false, Some(runtime)) = (session.shell_mode, &runtime) {
                let cli = self.cli.clone();
                let container = session.container_name.clone();
                runtime.spawn(async move { cli.stop(&container).await });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> DockerAdapter {
        let config = DockerAdapterConfig {
            environment_id: "env-1".into(),
            auth_dir: PathBuf::from("/tmp/auth"),
            docker_program: "termhub-no-such-docker".into(),
            ..DockerAdapterConfig::default()
        };
        DockerAdapter::new(config, EventEmitter::channel().0)
            .with_mount_context(MountContext::default())
    }

    #[test]
    fn test_config_defaults() {
        let config = DockerAdapterConfig::default();
        assert_eq!(config.image_name, "claude-code-sandboxed");
        assert_eq!(config.image_tag, "latest");
        assert_eq!(config.docker_program, "docker");
    }

    #[tokio::test]
    async fn test_missing_working_dir_rejected() {
        let adapter = adapter();
        let dir = tempfile::tempdir().unwrap();
        let err = adapter
            .create_session("s1", &dir.path().join("gone"), None, CreateSessionOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert!(!adapter.has_session("s1"));
        assert_eq!(adapter.sessions.generation("s1"), 0);
    }

    #[tokio::test]
    async fn test_shell_without_parent_container_rejected() {
        let adapter = adapter();
        let dir = tempfile::tempdir().unwrap();
        let err = adapter
            .create_session("s1-terminal", dir.path(), None, CreateSessionOptions::shell())
            .await
            .unwrap_err();
        match err {
            SessionError::Validation(msg) => assert!(msg.contains("start the agent session first")),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!adapter.has_session("s1-terminal"));
    }

    #[tokio::test]
    async fn test_unknown_session_operations_are_noops() {
        let adapter = adapter();
        adapter.write("ghost", "x");
        adapter.resize("ghost", TerminalSize::new(120, 40));
        adapter.destroy_session("ghost").await;
        adapter.restart_session("ghost").await;
        assert!(adapter.session_ids().is_empty());
        assert_eq!(adapter.container_for("ghost"), None);
        assert_eq!(adapter.agent_session_id("ghost"), None);
    }
}

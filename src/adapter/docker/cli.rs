//! Thin async wrapper over the docker CLI

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);
const READY_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_GRACE_SECS: u32 = 10;

#[derive(Debug, Clone)]
pub(crate) struct DockerCli {
    program: String,
}

impl DockerCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run a docker subcommand, returning stdout on success
    async fn run(&self, args: &[&str], limit: Duration) -> Result<String> {
        let output = timeout(limit, Command::new(&self.program).args(args).output())
            .await
            .with_context(|| format!("docker {} timed out", args.join(" ")))?
            .with_context(|| format!("Failed to run {}", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("docker {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub async fn is_running(&self, container: &str) -> bool {
        match self
            .run(
                &["inspect", "--format", "{{.State.Running}}", container],
                Duration::from_secs(5),
            )
            .await
        {
            Ok(out) => out == "true",
            Err(e) => {
                debug!(container = %container, error = %e, "Container inspect failed");
                false
            }
        }
    }

    /// Poll until the container reports running.
    ///
    /// `still_starting` is checked before each poll; when it turns false the
    /// process behind the container is gone and waiting stops early.
    pub async fn wait_until_ready<F>(&self, container: &str, still_starting: F) -> Result<()>
    where
        F: Fn() -> bool,
    {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if !still_starting() {
                bail!("container {container} exited during startup");
            }
            if self.is_running(container).await {
                info!(container = %container, attempt, "Container is ready");
                return Ok(());
            }
            if started.elapsed() >= READY_TIMEOUT {
                bail!(
                    "container {container} did not start within {}s",
                    READY_TIMEOUT.as_secs()
                );
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// Stop a container, killing it if a graceful stop fails.
    ///
    /// A container that is already gone counts as stopped.
    pub async fn stop(&self, container: &str) {
        info!(container = %container, "Stopping container");
        let grace = STOP_GRACE_SECS.to_string();
        let result = self
            .run(
                &["stop", "-t", &grace, container],
                Duration::from_secs(u64::from(STOP_GRACE_SECS) + 5),
            )
            .await;

        let Err(e) = result else {
            return;
        };
        let message = format!("{e:#}");
        if message.contains("No such container") || message.contains("is not running") {
            debug!(container = %container, "Container already stopped");
            return;
        }

        warn!(container = %container, error = %message, "Graceful stop failed, killing");
        if let Err(e) = self.run(&["kill", container], Duration::from_secs(5)).await {
            warn!(container = %container, error = %e, "Failed to kill container");
        }
    }

    /// Wait (bounded) for a container to exit
    pub async fn wait_exit(&self, container: &str) {
        if let Err(e) = self.run(&["wait", container], Duration::from_secs(5)).await {
            debug!(container = %container, error = %e, "docker wait ended early");
        }
    }
}

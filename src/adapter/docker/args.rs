//! `docker run` / `docker exec` command lines

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::DockerAdapterConfig;
use crate::adapter::options::build_agent_args;
use crate::adapter::CreateSessionOptions;

const CONTAINER_HOME: &str = "/home/node";
const WORKSPACE: &str = "/workspace";
const SSH_AGENT_SOCKET: &str = "/ssh-agent";
const API_KEY_VAR: &str = "ANTHROPIC_API_KEY";

/// Host facts that decide which optional mounts and variables are added
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountContext {
    pub ssh_dir: Option<PathBuf>,
    pub gitconfig: Option<PathBuf>,
    pub ssh_auth_sock: Option<String>,
    pub forward_api_key: bool,
}

impl MountContext {
    /// Inspect the current user's home directory and environment
    pub fn from_host() -> Self {
        let home = dirs::home_dir();
        let existing = |name: &str| {
            home.as_ref()
                .map(|h| h.join(name))
                .filter(|p| p.exists())
        };
        Self {
            ssh_dir: existing(".ssh"),
            gitconfig: existing(".gitconfig"),
            ssh_auth_sock: std::env::var("SSH_AUTH_SOCK").ok().filter(|s| !s.is_empty()),
            forward_api_key: std::env::var(API_KEY_VAR).is_ok_and(|v| !v.is_empty()),
        }
    }
}

/// Disposable container name for an environment
pub(crate) fn container_name(environment_id: &str) -> String {
    let prefix: String = environment_id.chars().take(8).collect();
    let unique = uuid::Uuid::new_v4().simple().to_string();
    format!("termhub-env-{}-{}", prefix, &unique[..12])
}

fn volume(args: &mut Vec<String>, host: &Path, container: &str, read_only: bool) {
    args.push("-v".to_string());
    let suffix = if read_only { ":ro" } else { "" };
    args.push(format!("{}:{}{}", host.display(), container, suffix));
}

/// Arguments for `docker run` (everything after the `docker` binary)
pub(crate) fn build_run_args(
    config: &DockerAdapterConfig,
    container: &str,
    working_dir: &Path,
    options: &CreateSessionOptions,
    ctx: &MountContext,
    env_file: Option<&Path>,
) -> Vec<String> {
    let mut args: Vec<String> = ["run", "-it", "--rm", "--name", container]
        .iter()
        .map(|s| s.to_string())
        .collect();

    args.extend(
        ["--cap-drop", "ALL", "--security-opt", "no-new-privileges"]
            .iter()
            .map(|s| s.to_string()),
    );

    volume(&mut args, working_dir, WORKSPACE, false);
    args.push("-w".to_string());
    args.push(WORKSPACE.to_string());

    // agent state persists per environment
    volume(
        &mut args,
        &config.auth_dir.join("claude"),
        &format!("{CONTAINER_HOME}/.claude"),
        false,
    );
    volume(
        &mut args,
        &config.auth_dir.join("config").join("claude"),
        &format!("{CONTAINER_HOME}/.config/claude"),
        false,
    );

    if let Some(ssh_dir) = &ctx.ssh_dir {
        volume(&mut args, ssh_dir, &format!("{CONTAINER_HOME}/.ssh"), true);
    }
    if let Some(gitconfig) = &ctx.gitconfig {
        volume(&mut args, gitconfig, &format!("{CONTAINER_HOME}/.gitconfig"), true);
    }

    if let Some(sock) = &ctx.ssh_auth_sock {
        volume(&mut args, Path::new(sock), SSH_AGENT_SOCKET, false);
        args.push("-e".to_string());
        args.push(format!("SSH_AUTH_SOCK={SSH_AGENT_SOCKET}"));
    }

    // name only: docker copies the value from our environment
    if ctx.forward_api_key {
        args.push("-e".to_string());
        args.push(API_KEY_VAR.to_string());
    }

    if let Some(path) = env_file {
        args.push("--env-file".to_string());
        args.push(path.display().to_string());
    }

    args.push("--entrypoint".to_string());
    if options.shell_mode {
        args.push("/bin/sh".to_string());
    } else {
        args.push(config.agent_program.clone());
    }

    args.push(format!("{}:{}", config.image_name, config.image_tag));

    if !options.shell_mode {
        let agent_options = match &options.agent_options {
            Some(overrides) => config.default_agent_options.merged_with(overrides),
            None => config.default_agent_options.clone(),
        };
        args.extend(build_agent_args(
            &agent_options,
            options.resume_token.as_deref(),
        ));
    }

    args
}

/// Arguments for a shell attached to a running container
pub(crate) fn build_exec_args(container: &str, shell: &str) -> Vec<String> {
    ["exec", "-it", "-w", WORKSPACE, container, shell]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Write `KEY=value` lines to a private temporary file for `--env-file`.
///
/// Returns `None` when there is nothing to write.
pub(crate) fn write_env_file(vars: &[(String, String)]) -> Result<Option<PathBuf>> {
    if vars.is_empty() {
        return Ok(None);
    }

    let path = std::env::temp_dir().join(format!(
        "termhub-env-{}",
        uuid::Uuid::new_v4().simple()
    ));

    let mut open = std::fs::OpenOptions::new();
    open.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        open.mode(0o600);
    }
    let mut file = open
        .open(&path)
        .with_context(|| format!("Failed to create env file: {}", path.display()))?;

    let mut content = String::new();
    for (key, value) in vars {
        // one variable per line; newlines in values would start a new one
        let value = value.replace(['\n', '\r'], " ");
        content.push_str(&format!("{key}={value}\n"));
    }
    file.write_all(content.as_bytes())
        .with_context(|| format!("Failed to write env file: {}", path.display()))?;

    Ok(Some(path))
}

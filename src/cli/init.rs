//! Init command implementation

use anyhow::{bail, Result};
use std::path::PathBuf;

use termhub::config::Config;

/// Default configuration content for termhub init
pub const DEFAULT_CONFIG: &str = r#"# termhub configuration
# =====================
#
# Every value below is the built-in default. TERMHUB_IDLE_TIMEOUT_MINUTES,
# TERMHUB_SCROLLBACK_BYTES and TERMHUB_BIND override the file.

[server]
bind = "127.0.0.1:3200"
# Frames queued per viewer; sends beyond this are dropped for that viewer
outbox_capacity = 256

[lifecycle]
# Suspend sessions nobody has touched for this long (0 = never, minimum 5)
idle_timeout_minutes = 30
# Seconds allowed for pausing every session on shutdown
shutdown_grace_secs = 5

[scrollback]
# Recent output kept per session and replayed to new viewers
max_bytes = 102400

[host]
agent_program = "claude"
# shell_program = "/bin/zsh"
# Shell sessions may only start inside this directory
# shell_root = "/home/me/projects"

[host.agent_options]
# model = "sonnet"
# permission_mode = "acceptEdits"
# allowed_tools = ["Read", "Grep"]
# disallowed_tools = []
# extra_args = []

[docker]
docker_program = "docker"
image_name = "claude-code-sandboxed"
image_tag = "latest"
agent_program = "claude"
# Advisory only
max_concurrent_containers = 4

# ============================================================================
# ENVIRONMENTS AND SESSIONS
# ============================================================================
#
# [[environment]]
# id = "sandbox"
# name = "Sandbox"
# type = "DOCKER"
# auth_dir = "/home/me/.termhub/auth/sandbox"
#
# [[session]]
# id = "demo"
# working_dir = "/home/me/projects/demo"
# environment_id = "sandbox"
# initial_prompt = "Summarize this repository"
"#;

pub fn init_command(config_path: Option<PathBuf>, force: bool) -> Result<()> {
    let config_path = config_path.unwrap_or_else(Config::global_config_path);

    if !Config::write_file(&config_path, DEFAULT_CONFIG, force)? {
        bail!(
            "Configuration already exists: {}\nUse --force to overwrite.",
            config_path.display()
        );
    }
    println!("Created: {}", config_path.display());

    Ok(())
}

//! Agent CLI flags and process environment

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Set by the agent CLI in its children; removed so a spawned agent does
/// not think it is nested inside another one
pub const NESTED_AGENT_MARKER: &str = "CLAUDECODE";

static ENV_KEY_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok());

/// Flags for the agent CLI, merged from config defaults and per-session overrides
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentOptions {
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub append_system_prompt: Option<String>,
    pub dangerously_skip_permissions: Option<bool>,
    /// Raw flags appended as-is
    pub extra_args: Vec<String>,
}

impl AgentOptions {
    /// Layer `overrides` on top of `self`.
    ///
    /// Set fields in `overrides` win; an empty string clears the field.
    pub fn merged_with(&self, overrides: &AgentOptions) -> AgentOptions {
        fn pick(base: &Option<String>, over: &Option<String>) -> Option<String> {
            match over {
                Some(v) if v.is_empty() => None,
                Some(v) => Some(v.clone()),
                None => base.clone().filter(|v| !v.is_empty()),
            }
        }
        fn pick_list(base: &[String], over: &[String]) -> Vec<String> {
            if over.is_empty() {
                base.to_vec()
            } else {
                over.to_vec()
            }
        }

        AgentOptions {
            model: pick(&self.model, &overrides.model),
            permission_mode: pick(&self.permission_mode, &overrides.permission_mode),
            allowed_tools: pick_list(&self.allowed_tools, &overrides.allowed_tools),
            disallowed_tools: pick_list(&self.disallowed_tools, &overrides.disallowed_tools),
            append_system_prompt: pick(&self.append_system_prompt, &overrides.append_system_prompt),
            dangerously_skip_permissions: overrides
                .dangerously_skip_permissions
                .or(self.dangerously_skip_permissions),
            extra_args: pick_list(&self.extra_args, &overrides.extra_args),
        }
    }
}

/// Build the agent's argument list
pub fn build_agent_args(options: &AgentOptions, resume_token: Option<&str>) -> Vec<String> {
    let mut args = Vec::new();

    if let Some(token) = resume_token.filter(|t| !t.is_empty()) {
        args.push("--resume".to_string());
        args.push(token.to_string());
    }

    if let Some(model) = options.model.as_deref() {
        args.push("--model".to_string());
        args.push(model.to_string());
    }

    if options.dangerously_skip_permissions == Some(true) {
        args.push("--dangerously-skip-permissions".to_string());
    }

    if let Some(mode) = options.permission_mode.as_deref().filter(|m| !m.trim().is_empty()) {
        args.push("--permission-mode".to_string());
        args.push(mode.to_string());
    }

    if let Some(prompt) = options.append_system_prompt.as_deref() {
        args.push("--append-system-prompt".to_string());
        args.push(prompt.to_string());
    }

    // Each tool as a separate argument
    if !options.disallowed_tools.is_empty() {
        args.push("--disallowedTools".to_string());
        args.extend(options.disallowed_tools.iter().cloned());
    }

    if !options.allowed_tools.is_empty() {
        args.push("--allowedTools".to_string());
        args.extend(options.allowed_tools.iter().cloned());
    }

    for extra in &options.extra_args {
        // control characters act as separators
        let cleaned: String = extra
            .chars()
            .map(|c| if c.is_control() { ' ' } else { c })
            .collect();
        args.extend(cleaned.split_whitespace().map(str::to_string));
    }

    args
}

pub fn is_valid_env_key(key: &str) -> bool {
    ENV_KEY_PATTERN.as_ref().is_some_and(|re| re.is_match(key))
}

/// Validated custom variables, sorted by key.
///
/// Invalid keys and the nested-agent marker are dropped.
pub fn sanitize_env(custom: &HashMap<String, String>) -> Vec<(String, String)> {
    let mut vars: Vec<(String, String)> = custom
        .iter()
        .filter(|(key, _)| {
            if key.as_str() == NESTED_AGENT_MARKER {
                return false;
            }
            if !is_valid_env_key(key) {
                warn!(key = %key, "Dropping environment variable with invalid name");
                return false;
            }
            true
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    vars.sort();
    vars
}

/// Terminal variables every session process gets
pub(crate) fn terminal_env() -> [(&'static str, &'static str); 2] {
    [("TERM", "xterm-256color"), ("COLORTERM", "truecolor")]
}

/// Copy of `args` safe to log: secret-looking `NAME=value` pairs and
/// system prompts are masked
pub fn redact_args(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        out.push(redact_assignment(arg));
        if arg == "--append-system-prompt" && iter.next().is_some() {
            out.push("[redacted]".to_string());
        }
    }
    out
}

fn redact_assignment(arg: &str) -> String {
    const SECRET_HINTS: [&str; 5] = ["KEY", "TOKEN", "SECRET", "PASSWORD", "CREDENTIAL"];

    match arg.split_once('=') {
        Some((name, _))
            if SECRET_HINTS
                .iter()
                .any(|h| name.to_ascii_uppercase().contains(h)) =>
        {
            format!("{name}=***")
        }
        _ => arg.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_agent_args_order() {
        let options = AgentOptions {
            model: Some("opus".into()),
            permission_mode: Some("plan".into()),
            allowed_tools: vec!["Read".into(), "Grep".into()],
            disallowed_tools: vec!["Bash".into()],
            append_system_prompt: Some("be brief".into()),
            dangerously_skip_permissions: Some(true),
            extra_args: vec!["--verbose\n--debug".into()],
        };
        let args = build_agent_args(&options, Some("abc-123"));
        assert_eq!(
            args,
            vec![
                "--resume",
                "abc-123",
                "--model",
                "opus",
                "--dangerously-skip-permissions",
                "--permission-mode",
                "plan",
                "--append-system-prompt",
                "be brief",
                "--disallowedTools",
                "Bash",
                "--allowedTools",
                "Read",
                "Grep",
                "--verbose",
                "--debug",
            ]
        );
    }

    #[test]
    fn test_build_agent_args_empty() {
        assert!(build_agent_args(&AgentOptions::default(), None).is_empty());
        assert!(build_agent_args(&AgentOptions::default(), Some("")).is_empty());
    }

    #[test]
    fn test_merge_overrides_and_clears() {
        let base = AgentOptions {
            model: Some("sonnet".into()),
            permission_mode: Some("default".into()),
            allowed_tools: vec!["Read".into()],
            dangerously_skip_permissions: Some(true),
            ..Default::default()
        };
        let overrides = AgentOptions {
            model: Some("opus".into()),
            permission_mode: Some(String::new()),
            dangerously_skip_permissions: Some(false),
            ..Default::default()
        };
        let merged = base.merged_with(&overrides);
        assert_eq!(merged.model.as_deref(), Some("opus"));
        assert_eq!(merged.permission_mode, None);
        assert_eq!(merged.allowed_tools, vec!["Read".to_string()]);
        assert_eq!(merged.dangerously_skip_permissions, Some(false));
    }

    #[test]
    fn test_env_key_validation() {
        assert!(is_valid_env_key("API_KEY"));
        assert!(is_valid_env_key("_private"));
        assert!(!is_valid_env_key("1ABC"));
        assert!(!is_valid_env_key("BAD-KEY"));
        assert!(!is_valid_env_key("X=Y"));
        assert!(!is_valid_env_key(""));
    }

    #[test]
    fn test_sanitize_env_drops_invalid_and_marker() {
        let mut custom = HashMap::new();
        custom.insert("GOOD".to_string(), "1".to_string());
        custom.insert("bad key".to_string(), "2".to_string());
        custom.insert(NESTED_AGENT_MARKER.to_string(), "1".to_string());
        custom.insert("ALSO_GOOD".to_string(), "3".to_string());
        assert_eq!(
            sanitize_env(&custom),
            vec![
                ("ALSO_GOOD".to_string(), "3".to_string()),
                ("GOOD".to_string(), "1".to_string()),
            ]
        );
    }

    #[test]
    fn test_redact_args() {
        let args: Vec<String> = [
            "run",
            "-e",
            "ANTHROPIC_API_KEY=sk-live",
            "-e",
            "SSH_AUTH_SOCK=/ssh-agent",
            "--append-system-prompt",
            "internal instructions",
            "--model",
            "opus",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let redacted = redact_args(&args);
        assert_eq!(
            redacted,
            vec![
                "run",
                "-e",
                "ANTHROPIC_API_KEY=***",
                "-e",
                "SSH_AUTH_SOCK=/ssh-agent",
                "--append-system-prompt",
                "[redacted]",
                "--model",
                "opus",
            ]
        );
    }
}

//! Agent conversation id detection in raw terminal output

use std::sync::Mutex;

use once_cell::sync::Lazy;
use regex::Regex;

/// Tail of previous output kept so a marker split across reads still matches
const CARRY_BYTES: usize = 128;

static SESSION_ID_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)Session ID:\s*([a-f0-9-]{36})",
        r"(?i)\bsession:\s*([^\s\]]+)",
        r"(?i)\[session:([^\]\s]+)\]",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Find the agent's conversation id in a piece of (ANSI-stripped) output.
///
/// Patterns are tried in order; the first match wins.
pub fn extract_agent_session_id(text: &str) -> Option<String> {
    SESSION_ID_PATTERNS
        .iter()
        .find_map(|re| re.captures(text))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Strip ANSI escape sequences and control characters from a string
pub fn strip_ansi_codes(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\x1b' {
            match chars.peek() {
                Some('[') => {
                    chars.next();
                    while let Some(&next) = chars.peek() {
                        chars.next();
                        if next.is_ascii_alphabetic() || next == '~' {
                            break;
                        }
                    }
                }
                // OSC: ESC ] ... BEL or ESC \
                Some(']') => {
                    chars.next();
                    while let Some(next) = chars.next() {
                        if next == '\x07' {
                            break;
                        }
                        if next == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                _ => {
                    chars.next();
                }
            }
        } else if c.is_ascii_control() && c != '\n' && c != '\t' {
            // drop
        } else {
            result.push(c);
        }
    }

    result
}

/// Per-session detector: reports the id once, on first sight
#[derive(Debug, Default)]
pub(crate) struct SessionIdDetector {
    state: Mutex<DetectorState>,
}

#[derive(Debug, Default)]
struct DetectorState {
    found: Option<String>,
    carry: String,
}

impl SessionIdDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of output; returns the id the first time it is seen
    pub fn scan(&self, chunk: &str) -> Option<String> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.found.is_some() {
            return None;
        }

        let mut text = std::mem::take(&mut state.carry);
        text.push_str(&strip_ansi_codes(chunk));

        if let Some(id) = extract_agent_session_id(&text) {
            state.found = Some(id.clone());
            return Some(id);
        }

        let mut start = text.len().saturating_sub(CARRY_BYTES);
        while !text.is_char_boundary(start) {
            start += 1;
        }
        state.carry = text[start..].to_string();
        None
    }

    pub fn detected(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .found
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_uuid_form() {
        let id = extract_agent_session_id("Session ID: abcdef12-3456-7890-abcd-ef1234567890\n");
        assert_eq!(id.as_deref(), Some("abcdef12-3456-7890-abcd-ef1234567890"));
    }

    #[test]
    fn test_extract_short_forms() {
        assert_eq!(
            extract_agent_session_id("log [session:abc-123] started").as_deref(),
            Some("abc-123")
        );
        assert_eq!(
            extract_agent_session_id("SESSION: deadbeef").as_deref(),
            Some("deadbeef")
        );
    }

    #[test]
    fn test_extract_keeps_whole_token() {
        let long = "a".repeat(40);
        assert_eq!(
            extract_agent_session_id(&format!("session: {long}\n")),
            Some(long)
        );
        assert_eq!(
            extract_agent_session_id("session: abc_def.123 ready").as_deref(),
            Some("abc_def.123")
        );
        assert_eq!(extract_agent_session_id("session: ab").as_deref(), Some("ab"));
        assert_eq!(
            extract_agent_session_id("[session:x.y_z]").as_deref(),
            Some("x.y_z")
        );
    }

    #[test]
    fn test_extract_no_match() {
        assert_eq!(extract_agent_session_id("Welcome to the agent"), None);
        assert_eq!(extract_agent_session_id("Resuming session 7f3e9a"), None);
        assert_eq!(extract_agent_session_id("session:"), None);
    }

    #[test]
    fn test_strip_ansi_codes() {
        assert_eq!(strip_ansi_codes("\x1b[1;32mgreen\x1b[0m"), "green");
        assert_eq!(strip_ansi_codes("\x1b]0;title\x07text"), "text");
        assert_eq!(strip_ansi_codes("a\rb\n"), "ab\n");
    }

    #[test]
    fn test_detector_reports_once() {
        let detector = SessionIdDetector::new();
        assert_eq!(detector.scan("booting...\n"), None);
        assert_eq!(detector.scan("[session:abcd-1234]").as_deref(), Some("abcd-1234"));
        assert_eq!(detector.scan("[session:ffff-0000]"), None);
        assert_eq!(detector.detected().as_deref(), Some("abcd-1234"));
    }

    #[test]
    fn test_detector_handles_split_marker() {
        let detector = SessionIdDetector::new();
        assert_eq!(detector.scan("\x1b[2mSession I"), None);
        let id = detector.scan("D: abcdef12-3456-7890-abcd-ef1234567890\x1b[0m");
        assert_eq!(id.as_deref(), Some("abcdef12-3456-7890-abcd-ef1234567890"));
    }
}

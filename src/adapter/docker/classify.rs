//! Container start failure classification

use crate::adapter::strip_ansi_codes;
use crate::domain::ExitInfo;
use crate::error::{BackendStartupError, StartupFailureKind};

/// Upper bound on output kept per session for classification
pub(crate) const CAPTURE_LIMIT: usize = 5000;

/// Known failure texts, checked in order (case-insensitive)
const SIGNATURES: &[(StartupFailureKind, &[&str])] = &[
    (
        StartupFailureKind::DaemonUnavailable,
        &[
            "cannot connect to the docker daemon",
            "is the docker daemon running",
            "error during connect",
        ],
    ),
    (
        StartupFailureKind::ImageNotFound,
        &[
            "unable to find image",
            "pull access denied",
            "no such image",
            "manifest unknown",
            "repository does not exist",
        ],
    ),
    (
        StartupFailureKind::MountDenied,
        &["mounts denied", "mount denied", "is not shared from the host", "invalid mount config"],
    ),
    (
        StartupFailureKind::PortConflict,
        &["port is already allocated", "address already in use"],
    ),
    (StartupFailureKind::PermissionDenied, &["permission denied", "eacces"]),
];

/// Match output text against the known failure signatures
pub fn classify_output(text: &str) -> Option<StartupFailureKind> {
    let lower = text.to_lowercase();
    SIGNATURES
        .iter()
        .find(|(_, needles)| needles.iter().any(|n| lower.contains(n)))
        .map(|(kind, _)| *kind)
}

/// Decide whether a container exit means it failed to start.
///
/// A clean exit is never a start failure. An abnormal exit is one when the
/// captured output matches a known signature, or when the container never
/// produced any output at all.
pub fn classify_exit(
    captured: &str,
    received_output: bool,
    exit: &ExitInfo,
) -> Option<BackendStartupError> {
    if !exit.is_abnormal() {
        return None;
    }

    if let Some(kind) = classify_output(captured) {
        return Some(BackendStartupError::new(kind, summarize(captured, kind)));
    }

    if !received_output {
        return Some(BackendStartupError::new(
            StartupFailureKind::Generic,
            format!(
                "container exited with code {} before producing any output; check the docker logs",
                exit.exit_code
            ),
        ));
    }

    None
}

/// The captured line that triggered the match, trimmed
fn summarize(captured: &str, kind: StartupFailureKind) -> String {
    let needles = SIGNATURES
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, n)| *n)
        .unwrap_or(&[]);
    captured
        .lines()
        .map(strip_ansi_codes)
        .find(|line| {
            let lower = line.to_lowercase();
            needles.iter().any(|n| lower.contains(n))
        })
        .map(|line| line.trim().to_string())
        .unwrap_or_else(|| kind.to_string())
}

/// Output captured from a container for classification on exit
#[derive(Debug, Default)]
pub(crate) struct StartupCapture {
    text: String,
    received_output: bool,
    /// The container reported running
    ready: bool,
    /// We killed the process ourselves (destroy, pause, shutdown, supersede)
    stop_requested: bool,
}

impl StartupCapture {
    /// Record a chunk; returns true for the first non-empty chunk
    pub fn record(&mut self, chunk: &str) -> bool {
        let first = !self.received_output && !chunk.is_empty();
        if !chunk.is_empty() {
            self.received_output = true;
        }
        if self.text.len() < CAPTURE_LIMIT {
            let room = CAPTURE_LIMIT - self.text.len();
            let mut end = chunk.len().min(room);
            while !chunk.is_char_boundary(end) {
                end -= 1;
            }
            self.text.push_str(&chunk[..end]);
        }
        first
    }

    /// Classify an exit, unless it was requested or the container had
    /// already started and talked to the viewer
    pub fn classify(&self, exit: &ExitInfo) -> Option<BackendStartupError> {
        if self.stop_requested || (self.ready && self.received_output) {
            return None;
        }
        classify_exit(&self.text, self.received_output, exit)
    }

    pub fn received_output(&self) -> bool {
        self.received_output
    }

    pub fn mark_ready(&mut self) {
        self.ready = true;
    }

    pub fn mark_stop_requested(&mut self) {
        self.stop_requested = true;
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    /// Start failure for a container that never became ready
    pub fn startup_error(&self, fallback: impl Into<String>) -> BackendStartupError {
        match classify_output(&self.text) {
            Some(kind) => BackendStartupError::new(kind, summarize(&self.text, kind)),
            None => BackendStartupError::new(StartupFailureKind::Generic, fallback),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_unavailable_before_any_output() {
        let captured = "docker: Cannot connect to the Docker daemon at unix:///var/run/docker.sock. \
                        Is the docker daemon running?\n";
        let err = classify_exit(captured, false, &ExitInfo::new(125, None)).unwrap();
        assert_eq!(err.kind, StartupFailureKind::DaemonUnavailable);
        assert!(err.detail.contains("Cannot connect to the Docker daemon"));
    }

    #[test]
    fn test_signatures() {
        assert_eq!(
            classify_output("Unable to find image 'sandbox:latest' locally"),
            Some(StartupFailureKind::ImageNotFound)
        );
        assert_eq!(
            classify_output("Error response from daemon: pull access denied for sandbox"),
            Some(StartupFailureKind::ImageNotFound)
        );
        assert_eq!(
            classify_output("docker: Error response from daemon: Mounts denied: /Users/x"),
            Some(StartupFailureKind::MountDenied)
        );
        assert_eq!(
            classify_output("Bind for 0.0.0.0:3000 failed: port is already allocated"),
            Some(StartupFailureKind::PortConflict)
        );
        assert_eq!(
            classify_output("open /workspace/.env: permission denied"),
            Some(StartupFailureKind::PermissionDenied)
        );
        assert_eq!(classify_output("all good"), None);
    }

    #[test]
    fn test_silent_abnormal_exit_is_generic() {
        let err = classify_exit("", false, &ExitInfo::new(1, None)).unwrap();
        assert_eq!(err.kind, StartupFailureKind::Generic);
    }

    #[test]
    fn test_ran_then_exited_is_not_a_start_failure() {
        assert!(classify_exit("bye\n", true, &ExitInfo::new(1, None)).is_none());
        assert!(classify_exit("", false, &ExitInfo::new(0, None)).is_none());
    }

    #[test]
    fn test_capture_is_bounded() {
        let mut capture = StartupCapture::default();
        assert!(capture.record("x"));
        assert!(!capture.record(&"y".repeat(CAPTURE_LIMIT * 2)));
        assert_eq!(capture.text.len(), CAPTURE_LIMIT);
        assert!(capture.received_output());
    }

    #[test]
    fn test_requested_stop_is_not_a_start_failure() {
        let mut capture = StartupCapture::default();
        capture.record("cat: /etc/x: Permission denied\r\n");
        let killed = ExitInfo::new(137, Some("SIGKILL".to_string()));
        assert!(capture.classify(&killed).is_some());

        capture.mark_stop_requested();
        assert!(capture.classify(&killed).is_none());
    }

    #[test]
    fn test_output_after_ready_is_not_a_start_failure() {
        let mut capture = StartupCapture::default();
        capture.mark_ready();
        // a ready container that never spoke still counts as failed
        assert!(capture.classify(&ExitInfo::new(1, None)).is_some());

        capture.record("open /workspace/.env: permission denied\n");
        assert!(capture.classify(&ExitInfo::new(1, None)).is_none());
    }

    #[test]
    fn test_startup_error_prefers_signature() {
        let mut capture = StartupCapture::default();
        assert_eq!(
            capture.startup_error("timed out").kind,
            StartupFailureKind::Generic
        );
        capture.record("docker: Error response from daemon: Mounts denied:\r\n");
        let err = capture.startup_error("timed out");
        assert_eq!(err.kind, StartupFailureKind::MountDenied);
        assert!(err.user_message().contains("file sharing"));
    }
}

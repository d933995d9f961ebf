//! Error types shared across adapters, transport and lifecycle

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::domain::EnvironmentKind;

/// Why a sandboxed backend failed to start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StartupFailureKind {
    ImageNotFound,
    PermissionDenied,
    DaemonUnavailable,
    PortConflict,
    MountDenied,
    Generic,
}

impl StartupFailureKind {
    /// Short remediation hint shown to viewers next to the error
    pub fn hint(self) -> &'static str {
        match self {
            StartupFailureKind::ImageNotFound => {
                "build or pull the sandbox image, then restart the session"
            }
            StartupFailureKind::PermissionDenied => {
                "check that your user may talk to the docker daemon and read the mounted paths"
            }
            StartupFailureKind::DaemonUnavailable => "start the docker daemon and retry",
            StartupFailureKind::PortConflict => {
                "stop the process holding the port or pick another one"
            }
            StartupFailureKind::MountDenied => {
                "share the working directory with docker (file sharing settings)"
            }
            StartupFailureKind::Generic => "inspect the container output above for details",
        }
    }
}

impl fmt::Display for StartupFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartupFailureKind::ImageNotFound => write!(f, "image not found"),
            StartupFailureKind::PermissionDenied => write!(f, "permission denied"),
            StartupFailureKind::DaemonUnavailable => write!(f, "docker daemon unavailable"),
            StartupFailureKind::PortConflict => write!(f, "port conflict"),
            StartupFailureKind::MountDenied => write!(f, "mount denied"),
            StartupFailureKind::Generic => write!(f, "container failed to start"),
        }
    }
}

/// A classified container start failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {detail}")]
pub struct BackendStartupError {
    pub kind: StartupFailureKind,
    pub detail: String,
}

impl BackendStartupError {
    pub fn new(kind: StartupFailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// Message forwarded to viewers: the failure plus what to do about it
    pub fn user_message(&self) -> String {
        format!("{} ({})", self, self.kind.hint())
    }
}

/// Errors returned by session creation and adapter resolution
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("working directory does not exist: {}", .0.display())]
    WorkingDirMissing(PathBuf),

    #[error("working directory is not a directory: {}", .0.display())]
    WorkingDirNotDirectory(PathBuf),

    #[error("{0}")]
    Validation(String),

    #[error("session {0} is already being created")]
    ConcurrentCreation(String),

    #[error("failed to spawn process for session {session_id}: {message}")]
    Spawn { session_id: String, message: String },

    #[error(transparent)]
    Startup(#[from] BackendStartupError),

    #[error("{0} environments are not supported")]
    UnsupportedEnvironment(EnvironmentKind),

    #[error("environment {0} is misconfigured: {1}")]
    EnvironmentConfig(String, String),
}

impl SessionError {
    pub(crate) fn spawn(session_id: &str, err: impl fmt::Display) -> Self {
        SessionError::Spawn {
            session_id: session_id.to_string(),
            message: err.to_string(),
        }
    }

    /// True for failures caused by bad input rather than by the backend
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SessionError::WorkingDirMissing(_)
                | SessionError::WorkingDirNotDirectory(_)
                | SessionError::Validation(_)
        )
    }
}

/// Failure to hand a frame to a viewer connection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportSendError {
    #[error("connection is closed")]
    Closed,

    #[error("connection outbox is full")]
    Backpressure,

    #[error("send failed: {0}")]
    Io(String),
}

/// Failure to map a session onto its execution environment
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("environment {0} not found")]
    EnvironmentNotFound(String),
}

/// Errors surfaced by the process lifecycle manager
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("server shutdown in progress")]
    ShuttingDown,
}

/// Errors surfaced when a viewer attaches to a session
#[derive(Debug, Error)]
pub enum HubError {
    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("server shutdown in progress")]
    ShuttingDown,
}

//! Messages exchanged with viewers over the websocket

use std::fmt;

use serde::{Deserialize, Serialize};

use super::TerminalSize;

/// Why a session's process was suspended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    IdleTimeout,
    Manual,
    ServerShutdown,
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PauseReason::IdleTimeout => write!(f, "idle_timeout"),
            PauseReason::Manual => write!(f, "manual"),
            PauseReason::ServerShutdown => write!(f, "server_shutdown"),
        }
    }
}

/// The signal that triggered a server shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownSignal {
    #[serde(rename = "SIGTERM")]
    Sigterm,
    #[serde(rename = "SIGINT")]
    Sigint,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Sigterm => write!(f, "SIGTERM"),
            ShutdownSignal::Sigint => write!(f, "SIGINT"),
        }
    }
}

/// Server to viewer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Data {
        content: String,
    },
    Exit {
        #[serde(rename = "exitCode")]
        exit_code: i32,
        signal: Option<String>,
    },
    Error {
        message: String,
    },
    ProcessPaused {
        reason: PauseReason,
    },
    ProcessResumed {
        #[serde(rename = "resumedWithHistory")]
        resumed_with_history: bool,
    },
    ServerShutdown {
        signal: ShutdownSignal,
    },
}

/// Viewer to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Input { data: String },
    Resize { data: TerminalSize },
    Restart,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_message_wire_format() {
        let msg = ServerMessage::Exit {
            exit_code: 1,
            signal: None,
        };
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"type":"exit","exitCode":1,"signal":null}"#
        );

        let msg = ServerMessage::ProcessPaused {
            reason: PauseReason::IdleTimeout,
        };
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"type":"process_paused","reason":"idle_timeout"}"#
        );

        let msg = ServerMessage::ServerShutdown {
            signal: ShutdownSignal::Sigterm,
        };
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"type":"server_shutdown","signal":"SIGTERM"}"#
        );
    }

    #[test]
    fn test_client_message_parsing() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"resize","data":{"cols":120,"rows":40}}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Resize {
                data: TerminalSize::new(120, 40)
            }
        );

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"restart"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Restart);

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"paste"}"#).is_err());
    }
}

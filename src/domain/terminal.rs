use serde::{Deserialize, Serialize};

/// Terminal dimensions in character cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

/// Largest accepted dimension from a viewer
pub const MAX_TERMINAL_DIMENSION: u16 = 1000;

impl TerminalSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Both dimensions in `1..=MAX_TERMINAL_DIMENSION`
    pub fn is_valid(&self) -> bool {
        (1..=MAX_TERMINAL_DIMENSION).contains(&self.cols)
            && (1..=MAX_TERMINAL_DIMENSION).contains(&self.rows)
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// How a session's process ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub exit_code: i32,
    pub signal: Option<String>,
}

impl ExitInfo {
    pub fn new(exit_code: i32, signal: Option<String>) -> Self {
        Self { exit_code, signal }
    }

    /// Exit that could not be observed (wait failed)
    pub fn unknown() -> Self {
        Self {
            exit_code: -1,
            signal: None,
        }
    }

    pub fn is_abnormal(&self) -> bool {
        self.exit_code != 0 || self.signal.is_some()
    }
}

//! Core domain types for termhub

mod environment;
mod message;
mod session;
mod terminal;

pub use environment::{EnvironmentKind, ExecutionEnvironment};
pub use message::{ClientMessage, PauseReason, ServerMessage, ShutdownSignal};
pub use session::SessionRecord;
pub use terminal::{ExitInfo, TerminalSize};

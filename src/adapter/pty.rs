//! A child process attached to a pseudo-terminal
//!
//! Output is read on a dedicated thread and handed to a callback as UTF-8
//! text; a second thread waits for the child and reports its exit once the
//! output is drained.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tracing::{debug, warn};

use super::options::{terminal_env, NESTED_AGENT_MARKER};
use crate::domain::{ExitInfo, TerminalSize};

/// How long the exit reporter waits for the reader to drain
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// What to run and how
#[derive(Debug, Clone)]
pub(crate) struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Validated extra variables, applied after the terminal overlay
    pub env: Vec<(String, String)>,
    pub size: TerminalSize,
}

impl SpawnSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            size: TerminalSize::default(),
        }
    }

    fn command(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.program);
        cmd.args(&self.args);
        if let Some(cwd) = &self.cwd {
            cmd.cwd(cwd);
        }
        cmd.env_remove(NESTED_AGENT_MARKER);
        for (key, value) in terminal_env() {
            cmd.env(key, value);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows.max(1),
        cols: size.cols.max(1),
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// A running PTY child
pub(crate) struct PtyProcess {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    pid: Option<u32>,
}

impl PtyProcess {
    /// Spawn the child. Blocking; call from `spawn_blocking`.
    ///
    /// `on_output` runs on the reader thread for every decoded chunk.
    /// `on_exit` runs exactly once, after the output has been drained.
    pub fn spawn<O, E>(spec: SpawnSpec, mut on_output: O, on_exit: E) -> Result<Self>
    where
        O: FnMut(&str) + Send + 'static,
        E: FnOnce(ExitInfo) + Send + 'static,
    {
        let pair = native_pty_system()
            .openpty(pty_size(spec.size))
            .context("Failed to open pty")?;

        let mut child = pair
            .slave
            .spawn_command(spec.command())
            .with_context(|| format!("Failed to spawn {}", spec.program))?;
        // the child holds its own copy; keeping ours would stop EOF on exit
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        let mut reader = pair.master.try_clone_reader().context("Failed to clone pty reader")?;
        let writer = pair.master.take_writer().context("Failed to take pty writer")?;

        let (drained_tx, drained_rx) = std_mpsc::channel::<()>();
        thread::spawn(move || {
            let mut buf = [0u8; 8192];
            let mut pending: Vec<u8> = Vec::new();
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        pending.extend_from_slice(&buf[..n]);
                        let text = drain_utf8(&mut pending);
                        if !text.is_empty() {
                            on_output(&text);
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!(error = %e, "PTY read ended");
                        break;
                    }
                }
            }
            if !pending.is_empty() {
                on_output(&String::from_utf8_lossy(&pending));
            }
            let _ = drained_tx.send(());
        });

        thread::spawn(move || {
            let info = match child.wait() {
                Ok(status) => ExitInfo::new(
                    status.exit_code() as i32,
                    status.signal().map(str::to_string),
                ),
                Err(e) => {
                    warn!(error = %e, "Failed to wait for PTY child");
                    ExitInfo::unknown()
                }
            };
            let _ = drained_rx.recv_timeout(READER_DRAIN_TIMEOUT);
            on_exit(info);
        });

        Ok(Self {
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            killer: Mutex::new(killer),
            pid,
        })
    }

    pub fn write(&self, data: &str) -> std::io::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writer.write_all(data.as_bytes())?;
        writer.flush()
    }

    pub fn resize(&self, size: TerminalSize) -> Result<()> {
        let master = self.master.lock().unwrap_or_else(|e| e.into_inner());
        master.resize(pty_size(size)).context("Failed to resize pty")
    }

    pub fn kill(&self) {
        let mut killer = self.killer.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = killer.kill() {
            debug!(pid = ?self.pid, error = %e, "Kill failed (process likely gone)");
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Take the longest valid UTF-8 prefix out of `pending`.
///
/// An incomplete sequence at the end stays in `pending` for the next read;
/// invalid bytes in the middle are replaced.
fn drain_utf8(pending: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(pending.as_slice()) {
            Ok(s) => {
                out.push_str(s);
                pending.clear();
                return out;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&pending[..valid]));
                match e.error_len() {
                    Some(bad) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        pending.drain(..valid + bad);
                    }
                    None => {
                        pending.drain(..valid);
                        return out;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_utf8_keeps_incomplete_tail() {
        let bytes = "héllo".as_bytes();
        // cut inside the two-byte 'é'
        let mut pending = bytes[..2].to_vec();
        assert_eq!(drain_utf8(&mut pending), "h");
        assert_eq!(pending.len(), 1);

        pending.extend_from_slice(&bytes[2..]);
        assert_eq!(drain_utf8(&mut pending), "éllo");
        assert!(pending.is_empty());
    }

    #[test]
    fn test_drain_utf8_replaces_invalid_bytes() {
        let mut pending = vec![b'a', 0xff, b'b'];
        assert_eq!(drain_utf8(&mut pending), "a\u{fffd}b");
        assert!(pending.is_empty());
    }

    #[test]
    fn test_spawn_spec_defaults() {
        let spec = SpawnSpec::new("sh");
        assert_eq!(spec.size, TerminalSize::new(80, 24));
        assert!(spec.args.is_empty());
        assert_eq!(pty_size(TerminalSize::new(0, 0)).cols, 1);
    }
}

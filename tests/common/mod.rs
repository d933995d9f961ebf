//! Shared test utilities for termhub integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;

use termhub::adapter::{AdapterEvent, AdapterEventKind};
use termhub::connection::{next_connection_id, Connection, ConnectionId, Frame};
use termhub::error::TransportSendError;

/// In-memory viewer that keeps every frame it was sent
pub struct RecordingConnection {
    id: ConnectionId,
    open: AtomicBool,
    fail_sends: AtomicBool,
    frames: Mutex<Vec<Frame>>,
}

impl RecordingConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: next_connection_id(),
            open: AtomicBool::new(true),
            fail_sends: AtomicBool::new(false),
            frames: Mutex::new(Vec::new()),
        })
    }

    /// Every send fails with backpressure from now on
    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    pub fn texts(&self) -> Vec<String> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter_map(|f| match f {
                Frame::Text(text) => Some(text.clone()),
                Frame::Binary(_) => None,
            })
            .collect()
    }

    /// Frames parsed as JSON, skipping anything that is not
    pub fn messages(&self) -> Vec<serde_json::Value> {
        self.texts()
            .iter()
            .filter_map(|t| serde_json::from_str(t).ok())
            .collect()
    }

    pub fn messages_of_type(&self, kind: &str) -> Vec<serde_json::Value> {
        self.messages()
            .into_iter()
            .filter(|m| m["type"] == kind)
            .collect()
    }

    /// All `data` message content joined together
    pub fn data_output(&self) -> String {
        self.messages_of_type("data")
            .iter()
            .filter_map(|m| m["content"].as_str().map(str::to_string))
            .collect()
    }
}

impl Connection for RecordingConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&self, frame: Frame) -> Result<(), TransportSendError> {
        if !self.is_open() {
            return Err(TransportSendError::Closed);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportSendError::Backpressure);
        }
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// Creates a temporary working directory for a session
pub fn create_workspace() -> TempDir {
    TempDir::new().expect("Failed to create temp dir")
}

/// Poll `check` until it holds or `limit` elapses
pub async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}

/// Receive adapter events until one matches, collecting data chunks on the way
pub async fn wait_for_event(
    rx: &mut mpsc::UnboundedReceiver<AdapterEvent>,
    limit: Duration,
    mut matches: impl FnMut(&AdapterEvent) -> bool,
) -> Option<AdapterEvent> {
    tokio::time::timeout(limit, async {
        while let Some(event) = rx.recv().await {
            if matches(&event) {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

/// Wait until the concatenated output of `session_id` contains `needle`
pub async fn wait_for_output(
    rx: &mut mpsc::UnboundedReceiver<AdapterEvent>,
    session_id: &str,
    needle: &str,
    limit: Duration,
) -> bool {
    let mut output = String::new();
    wait_for_event(rx, limit, |event| {
        if event.session_id != session_id {
            return false;
        }
        if let AdapterEventKind::Data(chunk) = &event.kind {
            output.push_str(chunk);
        }
        output.contains(needle)
    })
    .await
    .is_some()
}

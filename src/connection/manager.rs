//! Session to viewer fan-out
//!
//! [`ConnectionManager`] owns, per session, the set of attached viewers, the
//! named event handlers and the scrollback buffer used to replay history to
//! late joiners. The map lock is held only to snapshot or mutate the maps.
//! Each session also has an ordering lock, held while replaying scrollback to
//! a new viewer, recording output and broadcasting: a new viewer sees every
//! chunk exactly once, either in its replay or live.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{Connection, ConnectionId, Frame, Outbound};
use crate::adapter::AdapterEvent;
use crate::domain::ServerMessage;
use crate::scrollback::ScrollbackBuffer;

/// Broadcasts slower than this are logged
const SLOW_BROADCAST: Duration = Duration::from_millis(100);

/// Callback for one named adapter event of one session
pub type EventHandler = Arc<dyn Fn(&AdapterEvent) + Send + Sync>;

/// Counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionMetrics {
    /// Connections ever added (monotonic)
    pub total_connections: u64,
    /// Currently attached
    pub active_connections: u64,
    /// Frames handed to open connections (monotonic)
    pub messages_sent: u64,
    /// Frames a connection failed to take (monotonic)
    pub messages_dropped: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The last viewer of a session went away
    AllConnectionsClosed(String),
}

#[derive(Default)]
struct Inner {
    connections: HashMap<String, Vec<Arc<dyn Connection>>>,
    handlers: HashMap<String, HashMap<String, EventHandler>>,
    scrollback: HashMap<String, Arc<ScrollbackBuffer>>,
    ordering: HashMap<String, Arc<Mutex<()>>>,
    metrics: ConnectionMetrics,
}

/// Per-session viewer registry and broadcaster
pub struct ConnectionManager {
    inner: Mutex<Inner>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ordering lock of one session; never taken while `inner` is held
    fn ordering(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.lock()
            .ordering
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    /// Notifications about viewer sets (e.g. a session losing its last viewer)
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Attach a viewer and replay the session's scrollback to it alone, as
    /// one raw text frame.
    ///
    /// Returns false if this connection was already attached.
    pub fn add_connection(&self, session_id: &str, conn: Arc<dyn Connection>) -> bool {
        let ordering = self.ordering(session_id);
        let _ordered = ordering.lock().unwrap_or_else(|e| e.into_inner());
        let replay = {
            let mut inner = self.lock();
            let set = inner.connections.entry(session_id.to_string()).or_default();
            if set.iter().any(|c| c.id() == conn.id()) {
                debug!(session_id = %session_id, connection_id = conn.id(), "Connection already attached");
                return false;
            }
            set.push(conn.clone());
            let count = set.len();
            inner.metrics.total_connections += 1;
            inner.metrics.active_connections += 1;
            info!(session_id = %session_id, connection_id = conn.id(), viewers = count, "Viewer attached");

            inner
                .scrollback
                .get(session_id)
                .and_then(|buffer| buffer.contents())
        };

        if let Some(content) = replay {
            let bytes = content.len();
            if self.send_frame(session_id, &conn, Frame::Text(content)) {
                debug!(session_id = %session_id, connection_id = conn.id(), bytes, "Replayed scrollback");
            }
        }
        true
    }

    /// Detach a viewer. Returns whether it was attached.
    ///
    /// When the last viewer goes, the session's connection set and handlers
    /// are dropped and [`ConnectionEvent::AllConnectionsClosed`] is emitted.
    /// Scrollback is kept for the next viewer.
    pub fn remove_connection(&self, session_id: &str, connection_id: ConnectionId) -> bool {
        let now_empty = {
            let mut inner = self.lock();
            let Some(set) = inner.connections.get_mut(session_id) else {
                return false;
            };
            let before = set.len();
            set.retain(|c| c.id() != connection_id);
            if set.len() == before {
                return false;
            }
            let empty = set.is_empty();
            inner.metrics.active_connections = inner.metrics.active_connections.saturating_sub(1);
            if empty {
                inner.connections.remove(session_id);
                inner.handlers.remove(session_id);
            }
            empty
        };

        info!(session_id = %session_id, connection_id, "Viewer detached");
        if now_empty {
            info!(session_id = %session_id, "All viewers disconnected");
            let _ = self
                .events
                .send(ConnectionEvent::AllConnectionsClosed(session_id.to_string()));
        }
        true
    }

    fn snapshot(&self, session_id: &str) -> Vec<Arc<dyn Connection>> {
        self.lock()
            .connections
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Send one frame, updating the counters. Closed connections are skipped.
    fn send_frame(&self, session_id: &str, conn: &Arc<dyn Connection>, frame: Frame) -> bool {
        if !conn.is_open() {
            return false;
        }
        let result = conn.send(frame);
        let mut inner = self.lock();
        match result {
            Ok(()) => {
                inner.metrics.messages_sent += 1;
                true
            }
            Err(e) => {
                inner.metrics.messages_dropped += 1;
                drop(inner);
                warn!(session_id = %session_id, connection_id = conn.id(), error = %e, "Dropped message");
                false
            }
        }
    }

    /// Deliver a message to every open viewer of a session.
    ///
    /// Returns how many viewers took it. A failing viewer is counted as a
    /// drop and does not affect the others.
    pub fn broadcast(&self, session_id: &str, message: impl Into<Outbound>) -> usize {
        let Some(frame) = message.into().encode() else {
            return 0;
        };
        let ordering = self.ordering(session_id);
        let _ordered = ordering.lock().unwrap_or_else(|e| e.into_inner());
        self.deliver(session_id, frame)
    }

    /// Append process output to the session's scrollback and broadcast it,
    /// as one step with respect to [`add_connection`](Self::add_connection)
    pub fn record_output(&self, session_id: &str, chunk: &str) -> usize {
        let Some(frame) = Outbound::Message(ServerMessage::Data {
            content: chunk.to_string(),
        })
        .encode() else {
            return 0;
        };
        let ordering = self.ordering(session_id);
        let _ordered = ordering.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(buffer) = self.scrollback_buffer(session_id) {
            buffer.append(chunk);
        }
        self.deliver(session_id, frame)
    }

    /// Send to the current viewer set; the caller holds the ordering lock
    fn deliver(&self, session_id: &str, frame: Frame) -> usize {
        let targets = self.snapshot(session_id);
        if targets.is_empty() {
            return 0;
        }

        let started = Instant::now();
        let delivered = targets
            .iter()
            .filter(|conn| self.send_frame(session_id, conn, frame.clone()))
            .count();

        let elapsed = started.elapsed();
        if elapsed > SLOW_BROADCAST {
            warn!(
                session_id = %session_id,
                viewers = targets.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Slow broadcast"
            );
        }
        delivered
    }

    /// Deliver a message to every viewer of every session
    pub fn broadcast_all(&self, message: impl Into<Outbound>) -> usize {
        let Some(frame) = message.into().encode() else {
            return 0;
        };
        self.sessions()
            .iter()
            .map(|session_id| {
                let ordering = self.ordering(session_id);
                let _ordered = ordering.lock().unwrap_or_else(|e| e.into_inner());
                self.deliver(session_id, frame.clone())
            })
            .sum()
    }

    /// Deliver a message to one viewer of a session
    pub fn send_to_connection(
        &self,
        session_id: &str,
        connection_id: ConnectionId,
        message: impl Into<Outbound>,
    ) -> bool {
        let Some(conn) = self
            .snapshot(session_id)
            .into_iter()
            .find(|c| c.id() == connection_id)
        else {
            return false;
        };
        match message.into().encode() {
            Some(frame) => self.send_frame(session_id, &conn, frame),
            None => false,
        }
    }

    /// Close every viewer of a session and forget them
    pub fn close_all_connections(&self, session_id: &str) {
        let removed = {
            let mut inner = self.lock();
            let removed = inner.connections.remove(session_id).unwrap_or_default();
            inner.handlers.remove(session_id);
            inner.metrics.active_connections = inner
                .metrics
                .active_connections
                .saturating_sub(removed.len() as u64);
            removed
        };
        for conn in &removed {
            conn.close();
        }
        if !removed.is_empty() {
            info!(session_id = %session_id, closed = removed.len(), "Closed all viewers");
            let _ = self
                .events
                .send(ConnectionEvent::AllConnectionsClosed(session_id.to_string()));
        }
    }

    pub fn connection_count(&self, session_id: &str) -> usize {
        self.lock()
            .connections
            .get(session_id)
            .map_or(0, |set| set.len())
    }

    pub fn has_connections(&self, session_id: &str) -> bool {
        self.connection_count(session_id) > 0
    }

    /// Set the handler for one event of one session, replacing any previous one
    pub fn register_handler(&self, session_id: &str, event: &str, handler: EventHandler) {
        let replaced = self
            .lock()
            .handlers
            .entry(session_id.to_string())
            .or_default()
            .insert(event.to_string(), handler)
            .is_some();
        if replaced {
            warn!(session_id = %session_id, event = %event, "Replacing existing event handler");
        }
    }

    pub fn unregister_handler(&self, session_id: &str, event: &str) -> bool {
        let mut inner = self.lock();
        let Some(handlers) = inner.handlers.get_mut(session_id) else {
            return false;
        };
        let removed = handlers.remove(event).is_some();
        if handlers.is_empty() {
            inner.handlers.remove(session_id);
        }
        removed
    }

    pub fn has_handler(&self, session_id: &str, event: &str) -> bool {
        self.lock()
            .handlers
            .get(session_id)
            .is_some_and(|h| h.contains_key(event))
    }

    /// Run the handler registered for this event, if any
    pub fn dispatch(&self, event: &AdapterEvent) -> bool {
        let handler = self
            .lock()
            .handlers
            .get(&event.session_id)
            .and_then(|h| h.get(event.kind.name()))
            .cloned();
        match handler {
            Some(handler) => {
                handler(event);
                true
            }
            None => false,
        }
    }

    pub fn set_scrollback_buffer(&self, session_id: &str, buffer: Arc<ScrollbackBuffer>) {
        self.lock()
            .scrollback
            .insert(session_id.to_string(), buffer);
    }

    pub fn scrollback_buffer(&self, session_id: &str) -> Option<Arc<ScrollbackBuffer>> {
        self.lock().scrollback.get(session_id).cloned()
    }

    /// Forget everything about a session. Viewers are not closed.
    pub fn cleanup(&self, session_id: &str) {
        let mut inner = self.lock();
        if let Some(set) = inner.connections.remove(session_id) {
            inner.metrics.active_connections = inner
                .metrics
                .active_connections
                .saturating_sub(set.len() as u64);
        }
        inner.handlers.remove(session_id);
        inner.scrollback.remove(session_id);
        inner.ordering.remove(session_id);
        debug!(session_id = %session_id, "Cleaned up session connections");
    }

    /// Session ids with at least one viewer
    pub fn sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().connections.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn metrics(&self) -> ConnectionMetrics {
        self.lock().metrics
    }

    /// Drop all state and zero the counters
    pub fn reset(&self) {
        *self.lock() = Inner::default();
    }
}

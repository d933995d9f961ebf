//! Viewer connections and the per-session connection registry

mod manager;

pub use manager::{ConnectionEvent, ConnectionManager, ConnectionMetrics, EventHandler};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{mpsc, Notify};

use crate::domain::ServerMessage;
use crate::error::TransportSendError;

pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id for a new connection
pub fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// One outbound frame on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// A bidirectional channel to one viewer.
///
/// `send` must not block: a transport that cannot take the frame right away
/// reports [`TransportSendError::Backpressure`] instead.
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    fn is_open(&self) -> bool;

    fn send(&self, frame: Frame) -> Result<(), TransportSendError>;

    fn close(&self);
}

/// Something to deliver to viewers
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Passed through as-is
    Raw(String),
    Binary(Vec<u8>),
    /// Encoded once as a JSON envelope
    Message(ServerMessage),
}

impl Outbound {
    /// Wire form; `None` if a structured message cannot be encoded
    pub fn encode(&self) -> Option<Frame> {
        match self {
            Outbound::Raw(text) => Some(Frame::Text(text.clone())),
            Outbound::Binary(bytes) => Some(Frame::Binary(bytes.clone())),
            Outbound::Message(message) => match serde_json::to_string(message) {
                Ok(json) => Some(Frame::Text(json)),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to encode server message");
                    None
                }
            },
        }
    }
}

impl From<ServerMessage> for Outbound {
    fn from(message: ServerMessage) -> Self {
        Outbound::Message(message)
    }
}

impl From<String> for Outbound {
    fn from(text: String) -> Self {
        Outbound::Raw(text)
    }
}

impl From<&str> for Outbound {
    fn from(text: &str) -> Self {
        Outbound::Raw(text.to_string())
    }
}

/// Connection backed by a bounded channel drained by a socket writer task
pub struct ChannelConnection {
    id: ConnectionId,
    tx: mpsc::Sender<Frame>,
    open: AtomicBool,
    close_notify: Notify,
}

impl ChannelConnection {
    /// New connection plus the receiver its writer task drains
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn = Self {
            id: next_connection_id(),
            tx,
            open: AtomicBool::new(true),
            close_notify: Notify::new(),
        };
        (conn, rx)
    }

    /// Resolves once [`Connection::close`] has been called
    pub async fn closed(&self) {
        let notified = self.close_notify.notified();
        if !self.open.load(Ordering::Acquire) {
            return;
        }
        notified.await;
    }
}

impl Connection for ChannelConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    fn send(&self, frame: Frame) -> Result<(), TransportSendError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(TransportSendError::Closed);
        }
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportSendError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => TransportSendError::Closed,
        })
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
        self.close_notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_are_unique() {
        let a = next_connection_id();
        let b = next_connection_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_encode() {
        assert_eq!(Outbound::from("hi").encode(), Some(Frame::Text("hi".into())));
        let frame = Outbound::from(ServerMessage::Error {
            message: "boom".into(),
        })
        .encode();
        assert_eq!(
            frame,
            Some(Frame::Text(r#"{"type":"error","message":"boom"}"#.into()))
        );
    }

    #[tokio::test]
    async fn test_channel_connection_backpressure_and_close() {
        let (conn, mut rx) = ChannelConnection::new(1);
        assert!(conn.is_open());
        conn.send(Frame::Text("a".into())).unwrap();
        assert_eq!(
            conn.send(Frame::Text("b".into())),
            Err(TransportSendError::Backpressure)
        );
        assert_eq!(rx.recv().await, Some(Frame::Text("a".into())));

        conn.close();
        conn.closed().await;
        assert!(!conn.is_open());
        assert_eq!(
            conn.send(Frame::Text("c".into())),
            Err(TransportSendError::Closed)
        );
    }

    #[test]
    fn test_dropped_receiver_reads_as_closed() {
        let (conn, rx) = ChannelConnection::new(4);
        drop(rx);
        assert!(!conn.is_open());
    }
}

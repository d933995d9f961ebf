//! WebSocket endpoint for session viewers

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{AttachMode, SessionHub};
use crate::connection::{ChannelConnection, Connection, Frame};
use crate::domain::{ClientMessage, ServerMessage, ShutdownSignal, TerminalSize};

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
struct AppState {
    hub: Arc<SessionHub>,
    outbox_capacity: usize,
}

/// Initial terminal size, passed as `?cols=..&rows=..`
#[derive(Debug, Default, Deserialize)]
struct SizeQuery {
    cols: Option<u16>,
    rows: Option<u16>,
}

impl SizeQuery {
    fn size(&self) -> Option<TerminalSize> {
        let size = TerminalSize::new(self.cols?, self.rows?);
        size.is_valid().then_some(size)
    }
}

pub fn router(hub: Arc<SessionHub>, outbox_capacity: usize) -> Router {
    Router::new()
        .route("/ws/session/:id", get(agent_handler))
        .route("/ws/session/:id/terminal", get(shell_handler))
        .with_state(AppState {
            hub,
            outbox_capacity,
        })
}

async fn agent_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    Query(query): Query<SizeQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id, AttachMode::Agent, query.size()))
}

async fn shell_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    Query(query): Query<SizeQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id, AttachMode::Shell, query.size()))
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    session_id: String,
    mode: AttachMode,
    size: Option<TerminalSize>,
) {
    let (mut sender, mut receiver) = socket.split();
    let (conn, mut outbox) = ChannelConnection::new(state.outbox_capacity);
    let conn = Arc::new(conn);

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbox.recv().await {
            let message = match frame {
                Frame::Text(text) => Message::Text(text),
                Frame::Binary(bytes) => Message::Binary(bytes),
            };
            if sender.send(message).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let attachment = match state
        .hub
        .attach(&session_id, mode, conn.clone(), size)
        .await
    {
        Ok(attachment) => attachment,
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "Viewer attach failed");
            let error = ServerMessage::Error {
                message: e.to_string(),
            };
            if let Ok(json) = serde_json::to_string(&error) {
                let _ = conn.send(Frame::Text(json));
            }
            drop(conn);
            let _ = writer.await;
            return;
        }
    };
    info!(session_id = %session_id, process_id = %attachment.process_id, connection_id = attachment.connection_id, "Viewer connected");

    loop {
        let message = tokio::select! {
            message = receiver.next() => message,
            _ = conn.closed() => {
                debug!(session_id = %session_id, "Connection closed by server");
                break;
            }
        };
        let text = match message {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(session_id = %session_id, error = %e, "Socket read failed");
                break;
            }
        };
        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(message) => state.hub.handle_client_message(&attachment, message).await,
            Err(e) => warn!(session_id = %session_id, error = %e, "Invalid viewer message"),
        }
    }

    state.hub.detach(&attachment);
    conn.close();
    // the writer drains what is queued once the last sender is gone
    drop(conn);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        debug!(session_id = %session_id, "Viewer socket writer did not finish");
    }
    info!(session_id = %session_id, connection_id = attachment.connection_id, "Viewer disconnected");
}

/// Resolves on Ctrl-C or SIGTERM with the signal received
pub async fn shutdown_signal() -> ShutdownSignal {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
            ShutdownSignal::Sigint
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
            ShutdownSignal::Sigterm
        }
    }
}

/// Serve viewers until a shutdown signal, then pause every session
pub async fn serve(hub: Arc<SessionHub>, bind: SocketAddr, outbox_capacity: usize) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    info!(address = %bind, "Listening for viewers");

    let app = router(hub.clone(), outbox_capacity);
    let shutdown_hub = hub.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let signal = shutdown_signal().await;
            shutdown_hub.shutdown(signal).await;
        })
        .await
        .context("Server error")?;

    info!("Server stopped");
    Ok(())
}

//! Wiring between adapters, viewers and the lifecycle manager
//!
//! [`SessionHub`] is what the websocket server talks to. It starts session
//! processes when a viewer attaches, routes viewer input to the right
//! adapter, and turns adapter and lifecycle events into broadcasts.

mod server;

pub use server::{router, serve, shutdown_signal};

use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapter::{
    AdapterEvent, AdapterEventKind, AdapterFactory, CreateSessionOptions, EnvironmentAdapter,
};
use crate::connection::{Connection, ConnectionId, ConnectionManager, EventHandler};
use crate::domain::{ClientMessage, ServerMessage, ShutdownSignal, TerminalSize};
use crate::error::{HubError, LookupError};
use crate::lifecycle::{LifecycleEvent, ProcessLifecycleManager};
use crate::scrollback::ScrollbackBuffer;
use crate::store::EnvironmentStore;

/// Suffix of the process id for a session's plain shell
pub const SHELL_SESSION_SUFFIX: &str = "-terminal";

/// Which process of a session a viewer attaches to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachMode {
    Agent,
    Shell,
}

impl AttachMode {
    /// Adapter-level id of the process for this mode
    pub fn process_id(self, session_id: &str) -> String {
        match self {
            AttachMode::Agent => session_id.to_string(),
            AttachMode::Shell => format!("{session_id}{SHELL_SESSION_SUFFIX}"),
        }
    }
}

/// One viewer attached to one process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub session_id: String,
    pub process_id: String,
    pub mode: AttachMode,
    pub connection_id: ConnectionId,
}

pub struct SessionHub {
    factory: Arc<AdapterFactory>,
    connections: Arc<ConnectionManager>,
    lifecycle: Arc<ProcessLifecycleManager>,
    store: Arc<dyn EnvironmentStore>,
    scrollback_bytes: usize,
    lifecycle_events: Arc<AsyncMutex<broadcast::Receiver<LifecycleEvent>>>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionHub {
    pub fn new(
        factory: Arc<AdapterFactory>,
        connections: Arc<ConnectionManager>,
        lifecycle: Arc<ProcessLifecycleManager>,
        store: Arc<dyn EnvironmentStore>,
        scrollback_bytes: usize,
    ) -> Self {
        let lifecycle_events = Arc::new(AsyncMutex::new(lifecycle.subscribe()));
        Self {
            factory,
            connections,
            lifecycle,
            store,
            scrollback_bytes,
            lifecycle_events,
            pumps: Mutex::new(Vec::new()),
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn lifecycle(&self) -> &Arc<ProcessLifecycleManager> {
        &self.lifecycle
    }

    pub fn factory(&self) -> &Arc<AdapterFactory> {
        &self.factory
    }

    /// Start forwarding adapter and lifecycle events
    pub fn spawn_event_pumps(self: &Arc<Self>, mut adapter_events: mpsc::UnboundedReceiver<AdapterEvent>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let adapter_pump = tokio::spawn(async move {
            while let Some(event) = adapter_events.recv().await {
                let Some(hub) = weak.upgrade() else {
                    break;
                };
                hub.handle_adapter_event(event);
            }
            debug!("Adapter event pump stopped");
        });

        let weak: Weak<Self> = Arc::downgrade(self);
        let lifecycle_events = self.lifecycle_events.clone();
        let lifecycle_pump = tokio::spawn(async move {
            let mut lifecycle_events = lifecycle_events.lock().await;
            loop {
                match lifecycle_events.recv().await {
                    Ok(event) => {
                        let Some(hub) = weak.upgrade() else {
                            break;
                        };
                        hub.handle_lifecycle_event(&event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Lifecycle event pump lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Lifecycle event pump stopped");
        });

        let mut pumps = self.pumps.lock().unwrap_or_else(|e| e.into_inner());
        pumps.push(adapter_pump);
        pumps.push(lifecycle_pump);
    }

    fn ensure_scrollback(&self, process_id: &str) -> Arc<ScrollbackBuffer> {
        if let Some(buffer) = self.connections.scrollback_buffer(process_id) {
            return buffer;
        }
        let buffer = Arc::new(ScrollbackBuffer::new(self.scrollback_bytes));
        self.connections
            .set_scrollback_buffer(process_id, buffer.clone());
        buffer
    }

    pub fn handle_adapter_event(&self, event: AdapterEvent) {
        match &event.kind {
            AdapterEventKind::Data(chunk) => {
                self.ensure_scrollback(&event.session_id);
                if !self.connections.dispatch(&event) {
                    self.connections.record_output(&event.session_id, chunk);
                }
                return;
            }
            AdapterEventKind::Exit(info) => {
                debug!(session_id = %event.session_id, exit_code = info.exit_code, "Process exited");
                self.lifecycle.clear_activity(&event.session_id);
                // a restarted process starts with an empty history
                if let Some(buffer) = self.connections.scrollback_buffer(&event.session_id) {
                    buffer.clear();
                }
            }
            AdapterEventKind::Error(message) => {
                warn!(session_id = %event.session_id, error = %message, "Session error");
            }
            AdapterEventKind::AgentSessionIdDetected(id) => {
                self.store.record_agent_session_id(&event.session_id, id);
            }
        }
        self.connections.dispatch(&event);
    }

    /// Data, exit and error events of a process go to its viewers
    fn register_session_handlers(&self, process_id: &str) {
        let handlers: [(&str, EventHandler); 3] = [
            ("data", self.output_recorder()),
            ("exit", self.broadcaster(|kind| match kind {
                AdapterEventKind::Exit(info) => Some(ServerMessage::Exit {
                    exit_code: info.exit_code,
                    signal: info.signal.clone(),
                }),
                _ => None,
            })),
            ("error", self.broadcaster(|kind| match kind {
                AdapterEventKind::Error(message) => Some(ServerMessage::Error {
                    message: message.clone(),
                }),
                _ => None,
            })),
        ];
        for (event, handler) in handlers {
            if !self.connections.has_handler(process_id, event) {
                self.connections.register_handler(process_id, event, handler);
            }
        }
    }

    /// Output goes through the scrollback so late joiners replay it
    fn output_recorder(&self) -> EventHandler {
        let connections = Arc::downgrade(&self.connections);
        Arc::new(move |event: &AdapterEvent| {
            let (Some(connections), AdapterEventKind::Data(chunk)) =
                (connections.upgrade(), &event.kind)
            else {
                return;
            };
            connections.record_output(&event.session_id, chunk);
        })
    }

    fn broadcaster<F>(&self, to_message: F) -> EventHandler
    where
        F: Fn(&AdapterEventKind) -> Option<ServerMessage> + Send + Sync + 'static,
    {
        let connections = Arc::downgrade(&self.connections);
        Arc::new(move |event: &AdapterEvent| {
            let (Some(connections), Some(message)) = (connections.upgrade(), to_message(&event.kind))
            else {
                return;
            };
            connections.broadcast(&event.session_id, message);
        })
    }

    pub fn handle_lifecycle_event(&self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::Paused { session_id, reason } => {
                self.connections
                    .broadcast(session_id, ServerMessage::ProcessPaused { reason: *reason });
            }
            LifecycleEvent::Resumed {
                session_id,
                resumed_with_history,
            } => {
                self.connections.broadcast(
                    session_id,
                    ServerMessage::ProcessResumed {
                        resumed_with_history: *resumed_with_history,
                    },
                );
            }
            LifecycleEvent::Shutdown { signal } => {
                let notified = self
                    .connections
                    .broadcast_all(ServerMessage::ServerShutdown { signal: *signal });
                info!(viewers = notified, "Notified viewers of shutdown");
            }
        }
    }

    fn adapter_for(&self, session_id: &str) -> Result<Arc<dyn EnvironmentAdapter>, HubError> {
        let environment = self.store.environment_for_session(session_id)?;
        Ok(self.factory.get_adapter(&environment)?)
    }

    /// Start the process for `mode` unless it is already running
    async fn ensure_process(
        &self,
        session_id: &str,
        mode: AttachMode,
        size: Option<TerminalSize>,
    ) -> Result<String, HubError> {
        let record = self
            .store
            .session(session_id)
            .ok_or_else(|| LookupError::SessionNotFound(session_id.to_string()))?;
        let adapter = self.adapter_for(session_id)?;
        let process_id = mode.process_id(session_id);
        if adapter.has_session(&process_id) {
            return Ok(process_id);
        }

        let (options, prompt) = match mode {
            AttachMode::Agent => (
                CreateSessionOptions {
                    resume_token: record.resume_token.clone(),
                    size,
                    ..CreateSessionOptions::default()
                },
                record.pending_prompt(),
            ),
            AttachMode::Shell => (
                CreateSessionOptions {
                    size,
                    ..CreateSessionOptions::shell()
                },
                None,
            ),
        };
        info!(session_id = %session_id, process_id = %process_id, resume = options.resume_token.is_some(), "Starting session process");
        adapter
            .create_session(&process_id, &record.working_dir, prompt, options)
            .await?;
        if mode == AttachMode::Agent {
            self.store.mark_started(session_id);
        }
        Ok(process_id)
    }

    /// Attach a viewer, starting the process if needed.
    ///
    /// The viewer gets the scrollback so far, then live output.
    pub async fn attach(
        &self,
        session_id: &str,
        mode: AttachMode,
        conn: Arc<dyn Connection>,
        size: Option<TerminalSize>,
    ) -> Result<Attachment, HubError> {
        if self.lifecycle.is_shutdown_in_progress() {
            return Err(HubError::ShuttingDown);
        }
        let process_id = self.ensure_process(session_id, mode, size).await?;

        self.ensure_scrollback(&process_id);
        self.register_session_handlers(&process_id);
        let connection_id = conn.id();
        self.connections.add_connection(&process_id, conn);
        self.lifecycle.update_activity(&process_id);

        Ok(Attachment {
            session_id: session_id.to_string(),
            process_id,
            mode,
            connection_id,
        })
    }

    pub fn detach(&self, attachment: &Attachment) {
        self.connections
            .remove_connection(&attachment.process_id, attachment.connection_id);
    }

    pub async fn handle_client_message(&self, attachment: &Attachment, message: ClientMessage) {
        let process_id = &attachment.process_id;
        self.lifecycle.update_activity(process_id);
        let adapter = self.factory.find_adapter_for_session(process_id);

        match message {
            ClientMessage::Input { data } => match adapter {
                Some(adapter) => adapter.write(process_id, &data),
                None => debug!(process_id = %process_id, "Input for stopped process dropped"),
            },
            ClientMessage::Resize { data } => {
                if !data.is_valid() {
                    warn!(process_id = %process_id, cols = data.cols, rows = data.rows, "Invalid resize ignored");
                    return;
                }
                if let Some(adapter) = adapter {
                    adapter.resize(process_id, data);
                }
            }
            ClientMessage::Restart => match adapter {
                Some(adapter) => {
                    info!(process_id = %process_id, "Restart requested");
                    adapter.restart_session(process_id).await;
                }
                None => {
                    info!(process_id = %process_id, "Restart requested for stopped process, starting it");
                    if let Err(e) = self
                        .ensure_process(&attachment.session_id, attachment.mode, None)
                        .await
                    {
                        self.connections.broadcast(
                            process_id,
                            ServerMessage::Error {
                                message: e.to_string(),
                            },
                        );
                    }
                }
            },
        }
    }

    /// Tell viewers, pause every session, then close every viewer
    pub async fn shutdown(&self, signal: ShutdownSignal) {
        self.lifecycle.initiate_shutdown(signal).await;

        let pumps: Vec<JoinHandle<()>> = self
            .pumps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for pump in pumps {
            pump.abort();
        }
        // deliver what the lifecycle pump had not handled yet
        let mut lifecycle_events = self.lifecycle_events.lock().await;
        loop {
            match lifecycle_events.try_recv() {
                Ok(event) => self.handle_lifecycle_event(&event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        drop(lifecycle_events);

        for process_id in self.connections.sessions() {
            self.connections.close_all_connections(&process_id);
        }
    }
}

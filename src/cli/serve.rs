//! Serve command: wire the managers together and run the websocket server

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use termhub::adapter::{AdapterFactory, EventEmitter};
use termhub::config::Config;
use termhub::connection::ConnectionManager;
use termhub::hub::{self, SessionHub};
use termhub::lifecycle::{FactoryStopper, ProcessLifecycleManager};
use termhub::store::{EnvironmentStore, InMemoryEnvironmentStore};

pub async fn serve_command(config_path: Option<&Path>, bind: Option<String>) -> Result<()> {
    let mut config = Config::load(config_path)?;
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    let addr = config.bind_addr()?;

    let (events, adapter_events) = EventEmitter::channel();
    let factory = Arc::new(AdapterFactory::new(
        config.host_adapter_config(),
        config.docker_defaults(),
        events,
    ));

    let store = Arc::new(InMemoryEnvironmentStore::from_config(&config));
    info!(
        sessions = store.session_count(),
        environments = config.environment.len(),
        "Loaded session store"
    );
    let store: Arc<dyn EnvironmentStore> = store;

    let lifecycle = Arc::new(ProcessLifecycleManager::new(
        config.lifecycle_config(),
        factory.clone(),
        store.clone(),
        Arc::new(FactoryStopper::new(factory.clone())),
    ));
    let connections = Arc::new(ConnectionManager::new());

    let hub = Arc::new(SessionHub::new(
        factory,
        connections,
        lifecycle.clone(),
        store,
        config.scrollback.max_bytes,
    ));
    hub.spawn_event_pumps(adapter_events);
    lifecycle.start_idle_checker();

    hub::serve(hub, addr, config.server.outbox_capacity)
        .await
        .context("Session server failed")
}

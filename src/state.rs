//! Application state module
//!
//! Contains the shared state used across all server connections.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

use crate::auth::AccountService;
use crate::config::ServerConfig;
use crate::error::Result;
use crate::game::persistence::{GameStore, JsonStore};
use crate::game::template::TemplateRegistry;
use crate::game::world::GameWorld;
use crate::net::dispatcher::SessionDispatcher;

/// Application state shared across all connections
pub struct AppState {
    /// Server configuration
    pub config: ServerConfig,
    /// Storage backend
    pub store: Arc<dyn GameStore>,
    /// Game world state
    pub world: Arc<GameWorld>,
    /// Session dispatcher for connected clients
    pub dispatcher: Arc<SessionDispatcher>,
    /// Shutdown signal sender
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    /// Create the application state backed by the JSON data directory
    pub fn new(config: ServerConfig, shutdown_tx: broadcast::Sender<()>) -> Result<Self> {
        let store: Arc<dyn GameStore> = Arc::new(JsonStore::open(&config.data_path)?);
        let templates = TemplateRegistry::load_json(&config.data_path.join("templates.json"))?;
        info!(
            data_path = %config.data_path.display(),
            templates = templates.len(),
            "Data loaded"
        );

        Ok(Self::with_store(config, store, Arc::new(templates), shutdown_tx))
    }

    /// Create the application state over an existing store
    pub fn with_store(
        config: ServerConfig,
        store: Arc<dyn GameStore>,
        templates: Arc<TemplateRegistry>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        let world = Arc::new(GameWorld::new(
            config.world_settings(),
            templates,
            Arc::clone(&store),
        ));

        let accounts = AccountService::new(Arc::clone(&store), config.dev_mode);
        if accounts.is_dev_mode() {
            info!("Account service running in DEVELOPMENT mode - unknown accounts are created at login");
        }

        let dispatcher = Arc::new(SessionDispatcher::new(
            config.dispatcher_settings(),
            Arc::clone(&world),
            accounts,
        ));

        Self {
            config,
            store,
            world,
            dispatcher,
            shutdown_tx,
        }
    }

    /// Load every configured map into the world
    pub fn load_world(&self) -> Result<usize> {
        self.world.load_all_maps()
    }
}

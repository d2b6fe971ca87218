//! Application state shared by all handlers.

use std::sync::Arc;

use execbox_core::{
    engine::SandboxEngine,
    management::{SandboxPool, SessionCoordinator},
};
use getset::Getters;

use crate::{config::ServerConfig, transport::Connection, ServerMessage, ServerResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Application state structure
#[derive(Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct AppState {
    /// The server configuration
    config: Arc<ServerConfig>,

    /// The per-runtime sandbox pool
    pool: Arc<SandboxPool>,

    /// The execution session coordinator
    coordinator: Arc<SessionCoordinator>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl AppState {
    /// Wires the pool and the coordinator to `engine`.
    pub fn new(config: Arc<ServerConfig>, engine: Arc<dyn SandboxEngine>) -> ServerResult<Self> {
        let registry = Arc::new(config.runtime_registry()?);
        let pool = Arc::new(SandboxPool::new(engine, registry, *config.get_limits()));
        let coordinator = Arc::new(SessionCoordinator::new(
            Arc::clone(&pool),
            config.get_exec_root().clone(),
        ));

        Ok(Self {
            config,
            pool,
            coordinator,
        })
    }

    /// Opens a protocol connection.
    pub fn connect(&self) -> (Connection, tokio::sync::mpsc::Receiver<ServerMessage>) {
        Connection::new(
            Arc::clone(&self.coordinator),
            self.config.transport_settings(),
        )
    }
}

//! Application state.

use keel_config::{KdlCompiler, QueueDriver, SecretsDriver, ServerConfig};
use keel_core::pipeline::Compiler;
use keel_core::queue::Broker;
use keel_core::secret::Vault;
use keel_core::{Error, Result};
use keel_db::{BuildStore, Database, SqlBuildStore};
use keel_scheduler::{
    BuildOrchestrator, HttpVault, MemoryBroker, MemoryVault, NumberAllocator, QueueRouter,
    SecretGateway, SqlBroker,
};
use std::sync::Arc;
use tracing::info;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub store: Arc<dyn BuildStore>,
    pub orchestrator: Arc<BuildOrchestrator>,
    pub compiler: Arc<dyn Compiler>,
}

impl AppState {
    /// Wire the store, broker, vault and orchestrator selected by `config`.
    pub fn new(db: Database, config: &ServerConfig) -> Result<Self> {
        let broker: Arc<dyn Broker> = match config.queue.driver {
            QueueDriver::Memory => Arc::new(MemoryBroker::new()),
            QueueDriver::Database => Arc::new(SqlBroker::new(db.clone())),
        };

        let vault: Arc<dyn Vault> = match config.secrets.driver {
            SecretsDriver::Memory => Arc::new(MemoryVault::new()),
            SecretsDriver::Vault => {
                let addr = config.secrets.addr.clone().ok_or_else(|| {
                    Error::InvalidArgument("secrets driver vault needs an addr".to_string())
                })?;
                Arc::new(HttpVault::new(
                    addr,
                    config.secrets.token.clone(),
                    config.secrets.timeout,
                )?)
            }
        };

        let router = QueueRouter::new(broker, &config.queue)?;
        info!(
            broker = router.broker_name(),
            vault = vault.name(),
            cluster = router.is_cluster(),
            routes = ?router.routes(),
            "Dispatch configured"
        );

        let store: Arc<dyn BuildStore> = Arc::new(SqlBuildStore::new(db.clone()));
        let orchestrator = BuildOrchestrator::new(
            store.clone(),
            NumberAllocator::new(store.clone(), config.allocator.max_attempts),
            SecretGateway::new(vault, config.secrets.timeout),
            Arc::new(router),
        );

        Ok(Self::from_parts(db, store, orchestrator))
    }

    pub fn from_parts(
        db: Database,
        store: Arc<dyn BuildStore>,
        orchestrator: BuildOrchestrator,
    ) -> Self {
        Self {
            db,
            store,
            orchestrator: Arc::new(orchestrator),
            compiler: Arc::new(KdlCompiler::new()),
        }
    }
}

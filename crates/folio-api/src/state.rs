//! Application state wiring storage and checkpoint services together.
//!
//! AppState pins the generic core services to the SQLite repository from
//! folio-infra so command handlers can stay concrete.

use std::path::PathBuf;
use std::sync::Arc;

use folio_core::event::EventBus;
use folio_core::workflow::checkpoint::CheckpointManager;
use folio_infra::config::{ensure_data_dir, load_engine_config, resolve_data_dir};
use folio_infra::sqlite::pool::DatabasePool;
use folio_infra::sqlite::workflow::SqliteWorkflowRepository;
use folio_types::config::EngineConfig;

/// Shared state for CLI command handlers.
pub struct AppState {
    pub data_dir: PathBuf,
    pub config: EngineConfig,
    pub repo: Arc<SqliteWorkflowRepository>,
    pub checkpoints: CheckpointManager<SqliteWorkflowRepository>,
}

impl AppState {
    /// Resolve the data directory, load `config.toml` and open the database.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        ensure_data_dir(&data_dir).await?;

        let config = load_engine_config(&data_dir).await;
        let pool = DatabasePool::open_in(&data_dir).await?;
        let repo = Arc::new(SqliteWorkflowRepository::new(pool));
        let checkpoints = CheckpointManager::new(
            repo.clone(),
            EventBus::new(config.event_capacity),
            config.snapshot_field_limit,
        );

        tracing::debug!(data_dir = %data_dir.display(), "application state ready");
        Ok(Self {
            data_dir,
            config,
            repo,
            checkpoints,
        })
    }
}

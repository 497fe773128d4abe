//! Application state for the CLI.
//!
//! Pins the queue store to its SQLite implementation and carries the loaded
//! configuration.

use std::path::PathBuf;
use std::sync::Arc;

use deskchat_infra::identity::EnvIdentityProvider;
use deskchat_infra::sqlite::{DatabasePool, SqlitePostJobStore};
use deskchat_types::config::ChatConfig;

/// Shared state handed to every command.
#[derive(Clone)]
pub struct AppState {
    pub data_dir: PathBuf,
    pub config: ChatConfig,
    pub store: Arc<SqlitePostJobStore>,
    pub identity: EnvIdentityProvider,
}

impl AppState {
    /// Open the queue database (running migrations) and wire the store.
    pub async fn init(data_dir: PathBuf, config: ChatConfig) -> anyhow::Result<Self> {
        let pool = DatabasePool::open(&data_dir).await?;

        Ok(Self {
            data_dir,
            config,
            store: Arc::new(SqlitePostJobStore::new(pool)),
            identity: EnvIdentityProvider::new(),
        })
    }
}

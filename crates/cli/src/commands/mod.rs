//! CLI commands for running and maintaining a bot fleet.

pub mod backup;
pub mod recover;
pub mod register;
pub mod run;
pub mod status;

pub use backup::{run_backup, BackupArgs};
pub use recover::{run_recover, RecoverArgs};
pub use register::{run_register, RegisterArgs};
pub use run::{run_fleet, RunArgs};
pub use status::{run_status, StatusArgs};

use anyhow::{Context, Result};
use bot_fleet_core::{ConfigLoader, FleetConfig};
use bot_fleet_orchestrator::SqliteStore;
use clap::Args;
use std::path::{Path, PathBuf};

/// Configuration and database options shared by every command.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Config file path
    #[arg(short, long, default_value = "config/Config.toml")]
    pub config: PathBuf,

    /// Database URL, overriding `database.url` from the config
    #[arg(long, env = "BOT_DATABASE_URL")]
    pub db_url: Option<String>,
}

impl StoreArgs {
    /// Loads the configuration with any database URL override applied.
    ///
    /// # Errors
    /// Returns an error if the configuration cannot be parsed.
    pub fn load_config(&self) -> Result<FleetConfig> {
        let mut config = ConfigLoader::load(&self.config)?;
        if let Some(url) = &self.db_url {
            config.database.url.clone_from(url);
        }
        Ok(config)
    }
}

/// Opens the SQLite store, creating the database directory if needed.
///
/// # Errors
/// Returns an error if the directory cannot be created or the connection fails.
pub async fn open_store(config: &FleetConfig) -> Result<SqliteStore> {
    let url = &config.database.url;
    if let Some(file) = url.strip_prefix("sqlite://") {
        let file = file.split('?').next().unwrap_or(file);
        if let Some(parent) = Path::new(file).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create database directory {}", parent.display())
                })?;
            }
        }
    }

    tracing::info!("Opening bot database at {}", url);
    SqliteStore::connect(url, config.database.max_connections).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use bot_fleet_core::{Bot, FleetStore};

    #[tokio::test]
    async fn test_open_store_creates_database_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("fleet.db");
        let mut config = FleetConfig::default();
        config.database.url = format!("sqlite://{}?mode=rwc", path.display());

        let store = open_store(&config).await.unwrap();
        store
            .upsert_bot(&Bot::new("bot-1", "owner", "hold", "paper", "BTC-USD"))
            .await
            .unwrap();
        assert!(path.exists());
        assert_eq!(store.list_bots().await.unwrap().len(), 1);
    }

    #[test]
    fn test_db_url_override() {
        let args = StoreArgs {
            config: PathBuf::from("absent.toml"),
            db_url: Some("sqlite://override.db".to_string()),
        };
        assert_eq!(args.load_config().unwrap().database.url, "sqlite://override.db");
    }
}

//! Manual backups of a stopped or running bot's latest snapshot.

use super::{open_store, StoreArgs};
use anyhow::Result;
use bot_fleet_core::{BackupType, FleetStore};
use bot_fleet_orchestrator::StateManager;
use clap::Args;
use std::sync::Arc;

#[derive(Args, Debug, Clone)]
pub struct BackupArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Bot to back up
    #[arg(long)]
    pub bot: String,

    /// Reason recorded with the backup
    #[arg(long, default_value = "manual backup")]
    pub reason: String,

    /// List existing backups instead of creating one
    #[arg(long)]
    pub list: bool,
}

/// Backs up the bot's latest stored snapshot, or lists its backups.
///
/// # Errors
/// Returns an error if no valid snapshot exists or the database fails.
pub async fn run_backup(args: BackupArgs) -> Result<()> {
    let config = args.store.load_config()?;
    let store: Arc<dyn FleetStore> = Arc::new(open_store(&config).await?);
    let state = StateManager::new(store, config.state);

    if args.list {
        let backups = state.list_backups(&args.bot).await?;
        println!("{}", serde_json::to_string_pretty(&backups)?);
        return Ok(());
    }

    let info = state
        .backup_latest(&args.bot, BackupType::Manual, &args.reason)
        .await?;
    println!(
        "Created backup {} of bot {} (snapshot v{}, {} bytes{})",
        info.id,
        info.bot_id,
        info.version,
        info.size_bytes,
        if info.compressed { ", compressed" } else { "" }
    );
    Ok(())
}

//! Restores a backup into a bot's latest snapshot.

use super::{open_store, StoreArgs};
use anyhow::{bail, Result};
use bot_fleet_core::{BotStatus, FleetStore};
use bot_fleet_orchestrator::{RecoveryOptions, StateManager};
use chrono::{DateTime, Utc};
use clap::Args;
use std::sync::Arc;

#[derive(Args, Debug, Clone)]
pub struct RecoverArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Bot to restore
    #[arg(long)]
    pub bot: String,

    /// Backup to restore; defaults to the newest
    #[arg(long, conflicts_with = "at")]
    pub backup_id: Option<String>,

    /// Restore the newest backup taken at or before this RFC 3339 time
    #[arg(long)]
    pub at: Option<DateTime<Utc>>,

    /// Skip checksum verification
    #[arg(long)]
    pub no_verify: bool,

    /// Do not restore positions
    #[arg(long)]
    pub skip_positions: bool,

    /// Do not restore open orders
    #[arg(long)]
    pub skip_orders: bool,

    /// Keep the current configuration
    #[arg(long)]
    pub skip_configuration: bool,

    /// Keep the current strategy and its state
    #[arg(long)]
    pub skip_strategy: bool,
}

impl RecoverArgs {
    #[must_use]
    pub fn options(&self) -> RecoveryOptions {
        RecoveryOptions {
            backup_id: self.backup_id.clone(),
            target_time: self.at,
            verify_integrity: !self.no_verify,
            restore_positions: !self.skip_positions,
            restore_orders: !self.skip_orders,
            restore_configuration: !self.skip_configuration,
            restore_strategy: !self.skip_strategy,
        }
    }
}

/// Restores a backup for a bot that is not marked running.
///
/// # Errors
/// Returns an error if the bot is running, no backup matches, or verification fails.
pub async fn run_recover(args: RecoverArgs) -> Result<()> {
    let config = args.store.load_config()?;
    let store: Arc<dyn FleetStore> = Arc::new(open_store(&config).await?);

    if let Some(bot) = store.get_bot(&args.bot).await? {
        if matches!(bot.status, BotStatus::Running | BotStatus::Paused | BotStatus::Starting) {
            bail!(
                "bot {} is {}; stop it before recovering",
                bot.id,
                bot.status
            );
        }
    }

    let state = StateManager::new(store, config.state);
    let snapshot = state.recover_from_backup(&args.bot, args.options()).await?;
    println!(
        "Restored bot {} as snapshot v{} ({} positions, {} open orders)",
        args.bot,
        snapshot.version,
        snapshot.payload.state.positions.len(),
        snapshot.payload.state.open_orders.len()
    );
    Ok(())
}

//! Fleet status from the database.

use super::{open_store, StoreArgs};
use anyhow::{anyhow, Result};
use bot_fleet_core::{Bot, FleetStore};
use bot_fleet_orchestrator::StateManager;
use clap::Args;
use std::sync::Arc;

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Show one bot in detail, including its latest snapshot and backups
    #[arg(long)]
    pub bot: Option<String>,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

/// Prints stored status for all bots, or details for one.
///
/// # Errors
/// Returns an error if the database cannot be read or the bot is unknown.
pub async fn run_status(args: StatusArgs) -> Result<()> {
    let config = args.store.load_config()?;
    let store: Arc<dyn FleetStore> = Arc::new(open_store(&config).await?);

    let Some(bot_id) = args.bot else {
        let bots = store.list_bots().await?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&bots)?);
        } else {
            print_table(&bots);
        }
        return Ok(());
    };

    let bot = store
        .get_bot(&bot_id)
        .await?
        .ok_or_else(|| anyhow!("bot {bot_id} not found"))?;
    let state = StateManager::new(Arc::clone(&store), config.state);
    let snapshot = state.load_snapshot(&bot_id).await.ok();
    let backups = state.list_backups(&bot_id).await?;

    if args.json {
        let detail = serde_json::json!({
            "bot": bot,
            "snapshot": snapshot,
            "backups": backups,
        });
        println!("{}", serde_json::to_string_pretty(&detail)?);
        return Ok(());
    }

    print_table(std::slice::from_ref(&bot));
    match snapshot {
        Some(snapshot) => {
            let saved = &snapshot.payload.state;
            println!();
            println!(
                "Snapshot v{} at {} ({} positions, {} open orders)",
                snapshot.version,
                snapshot.timestamp.format("%Y-%m-%d %H:%M:%S"),
                saved.positions.len(),
                saved.open_orders.len()
            );
            let perf = &saved.performance;
            println!(
                "  ticks {}  signals {}  trades {}  errors {}  pnl {}  drawdown {}",
                perf.ticks,
                perf.signals,
                perf.trades,
                perf.errors,
                perf.realized_pnl.round_dp(2),
                perf.max_drawdown.round_dp(2)
            );
            if let Some(error) = &saved.last_error {
                println!("  last error: {error}");
            }
        }
        None => println!("\nNo snapshot stored"),
    }

    println!("\nBackups ({}):", backups.len());
    for backup in &backups {
        println!(
            "  {}  {:<11} v{:<4} {:>8} bytes{}  {}",
            backup.id,
            backup.backup_type.as_str(),
            backup.version,
            backup.size_bytes,
            if backup.compressed { " (gz)" } else { "" },
            backup.reason
        );
    }
    Ok(())
}

fn print_table(bots: &[Bot]) {
    println!(
        "{:<20} {:<12} {:<10} {:<12} {:>8} {:>14} {:>8}",
        "BOT", "STRATEGY", "STATUS", "SYMBOL", "TRADES", "PNL", "WIN %"
    );
    for bot in bots {
        println!(
            "{:<20} {:<12} {:<10} {:<12} {:>8} {:>14} {:>7.1}%",
            bot.id,
            bot.strategy,
            bot.status.as_str(),
            bot.symbol,
            bot.performance.total_trades,
            bot.performance.realized_pnl.round_dp(2),
            bot.performance.win_rate * 100.0
        );
    }
}

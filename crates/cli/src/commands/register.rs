//! Adds or replaces a bot record and its credential.

use super::{open_store, StoreArgs};
use anyhow::{Context, Result};
use bot_fleet_core::{Bot, ExchangeCredential, FleetStore};
use clap::Args;

#[derive(Args, Debug, Clone)]
pub struct RegisterArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Bot id
    #[arg(long)]
    pub id: String,

    #[arg(long, default_value = "operator")]
    pub owner: String,

    /// Strategy name (`hold`, `momentum`)
    #[arg(short, long, default_value = "hold")]
    pub strategy: String,

    #[arg(long, default_value = "paper")]
    pub exchange: String,

    #[arg(long)]
    pub symbol: String,

    /// Credential id; created as an active credential if missing
    #[arg(long)]
    pub credential: String,

    /// Bot configuration as a JSON object
    #[arg(long, default_value = "{}")]
    pub configuration: String,
}

/// Stores the bot with status `stopped`.
///
/// # Errors
/// Returns an error if the configuration is not valid JSON or the database fails.
pub async fn run_register(args: RegisterArgs) -> Result<()> {
    let configuration: serde_json::Value =
        serde_json::from_str(&args.configuration).context("configuration must be JSON")?;
    let config = args.store.load_config()?;
    let store = open_store(&config).await?;

    if store.get_credential(&args.credential).await?.is_none() {
        store
            .upsert_credential(&ExchangeCredential::new(&args.credential, &args.exchange))
            .await?;
        tracing::info!("Created credential {} for {}", args.credential, args.exchange);
    }

    let bot = Bot::new(
        &args.id,
        &args.owner,
        &args.strategy,
        &args.exchange,
        &args.symbol,
    )
    .with_credential(&args.credential)
    .with_configuration(configuration);
    store.upsert_bot(&bot).await?;

    println!(
        "Registered bot {} ({} on {} {})",
        bot.id, bot.strategy, bot.exchange, bot.symbol
    );
    Ok(())
}

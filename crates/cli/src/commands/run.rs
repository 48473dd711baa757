//! Long-running fleet daemon.

use super::{open_store, StoreArgs};
use anyhow::{anyhow, Context, Result};
use bot_fleet_core::FleetStore;
use bot_fleet_orchestrator::shutdown::wait_for_signal;
use bot_fleet_orchestrator::{BotManager, PaperConnector, PaperExchange};
use clap::Args;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Paper market to quote, as SYMBOL=PRICE (repeatable)
    #[arg(long = "price", value_name = "SYMBOL=PRICE", value_parser = parse_price)]
    pub prices: Vec<(String, Decimal)>,

    /// Bid/ask spread applied to every paper market
    #[arg(long, default_value = "0.01")]
    pub spread: Decimal,

    /// Do not restart bots that were running when the process last exited
    #[arg(long)]
    pub no_restore: bool,
}

/// Parses `SYMBOL=PRICE`.
pub fn parse_price(value: &str) -> Result<(String, Decimal)> {
    let (symbol, price) = value
        .split_once('=')
        .ok_or_else(|| anyhow!("expected SYMBOL=PRICE, got '{value}'"))?;
    let price = Decimal::from_str(price.trim())
        .with_context(|| format!("invalid price for {symbol}"))?;
    if price <= Decimal::ZERO {
        return Err(anyhow!("price for {symbol} must be positive"));
    }
    Ok((symbol.trim().to_string(), price))
}

/// Runs the fleet until SIGINT or SIGTERM, then shuts every bot down.
///
/// # Errors
/// Returns an error if configuration, the database, or signal handling fails.
pub async fn run_fleet(args: RunArgs) -> Result<()> {
    let config = args.store.load_config()?;
    tracing::info!(
        "Starting bot fleet daemon with config {} (max {} bots)",
        args.store.config.display(),
        config.manager.max_concurrent_bots
    );

    let store: Arc<dyn FleetStore> = Arc::new(open_store(&config).await?);

    let paper = Arc::new(PaperExchange::new());
    for (symbol, price) in &args.prices {
        paper.set_price(symbol, *price, args.spread);
        tracing::info!("Paper market {} quoted at {}", symbol, price);
    }

    let manager = BotManager::builder(config, store, Arc::new(PaperConnector::new(paper))).build();
    manager.spawn_background();

    if args.no_restore {
        tracing::info!("Skipping bot restore");
    } else {
        let restored = manager.restore_running_bots().await;
        let failed = restored.iter().filter(|(_, r)| r.is_err()).count();
        for (bot_id, result) in &restored {
            if let Err(e) = result {
                tracing::error!("Failed to restore bot {}: {}", bot_id, e);
            }
        }
        tracing::info!(
            "Restored {} bot(s), {} failed",
            restored.len() - failed,
            failed
        );
    }

    let signal = wait_for_signal().await?;
    let reports = manager
        .shutdown(&format!("received {signal}"), Some(signal))
        .await;

    let unclean = reports.iter().filter(|r| !r.is_clean()).count();
    if unclean > 0 {
        tracing::warn!("{} bot(s) did not shut down cleanly", unclean);
    }
    tracing::info!("Bot fleet daemon exited");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_price() {
        let (symbol, price) = parse_price("BTC-USD=64250.5").unwrap();
        assert_eq!(symbol, "BTC-USD");
        assert_eq!(price, Decimal::new(642_505, 1));

        assert!(parse_price("BTC-USD").is_err());
        assert!(parse_price("BTC-USD=abc").is_err());
        assert!(parse_price("BTC-USD=0").is_err());
    }
}

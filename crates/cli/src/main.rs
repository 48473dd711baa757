use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

use commands::{BackupArgs, RecoverArgs, RegisterArgs, RunArgs, StatusArgs};

#[derive(Parser)]
#[command(name = "bot-fleet")]
#[command(about = "Run and maintain a fleet of trading bots", long_about = None)]
struct Cli {
    /// Optional log file path (logs to file instead of stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the fleet daemon until SIGINT/SIGTERM
    Run(RunArgs),
    /// Show stored bot status
    Status(StatusArgs),
    /// Back up a bot's latest snapshot
    Backup(BackupArgs),
    /// Restore a bot from a backup
    Recover(RecoverArgs),
    /// Add or replace a bot record
    Register(RegisterArgs),
}

fn init_logging(log_file: Option<&PathBuf>) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_ref())?;

    match cli.command {
        Commands::Run(args) => commands::run_fleet(args).await?,
        Commands::Status(args) => commands::run_status(args).await?,
        Commands::Backup(args) => commands::run_backup(args).await?,
        Commands::Recover(args) => commands::run_recover(args).await?,
        Commands::Register(args) => commands::run_register(args).await?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_accepts_repeated_prices() {
        let cli = Cli::try_parse_from([
            "bot-fleet",
            "run",
            "--config",
            "fleet.toml",
            "--price",
            "BTC-USD=100",
            "--price",
            "ETH-USD=3000",
        ])
        .unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.store.config, PathBuf::from("fleet.toml"));
                assert_eq!(args.prices.len(), 2);
                assert!(!args.no_restore);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_recover_flags_map_to_options() {
        let cli = Cli::try_parse_from([
            "bot-fleet",
            "recover",
            "--bot",
            "bot-1",
            "--skip-positions",
            "--no-verify",
        ])
        .unwrap();
        let Commands::Recover(args) = cli.command else {
            panic!("expected recover");
        };
        let options = args.options();
        assert!(!options.restore_positions);
        assert!(options.restore_orders);
        assert!(!options.verify_integrity);
        assert!(options.backup_id.is_none());
    }

    #[test]
    fn test_backup_id_conflicts_with_time() {
        let parsed = Cli::try_parse_from([
            "bot-fleet",
            "recover",
            "--bot",
            "bot-1",
            "--backup-id",
            "abc",
            "--at",
            "2026-01-01T00:00:00Z",
        ]);
        assert!(parsed.is_err());
    }
}

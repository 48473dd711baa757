pub mod commands;
pub mod manager;
pub mod paper;
pub mod recovery;
pub mod reliability;
pub mod runtime;
pub mod shutdown;
pub mod state;
pub mod store;
pub mod strategies;
pub mod trade;
pub mod watchdog;

pub use commands::{BotCommand, CommandResponse, RecoverRequest, SwitchOptions};
pub use manager::{BotManager, BotManagerBuilder, BotStatusView, HealthWarning};
pub use paper::{PaperConnector, PaperExchange};
pub use recovery::{ErrorContext, ErrorRecoveryManager, RecoveryOutcome};
pub use reliability::{BotReliabilitySystem, HealthReport};
pub use runtime::BotRuntime;
pub use shutdown::{GracefulShutdownManager, ShutdownReport};
pub use state::{BackupInfo, RecoveryOptions, StateManager};
pub use store::{MemoryStore, SqliteStore};
pub use strategies::StrategyRegistry;
pub use trade::{TradeDecisionEngine, TradeExecutor};
pub use watchdog::{BotController, BotWatchdog, HealthMetrics};

pub mod bot;
pub mod classification;
pub mod config;
pub mod config_loader;
pub mod error;
pub mod events;
pub mod state;
pub mod store;
pub mod trading;
pub mod traits;

pub use bot::{Bot, BotStatus, ExchangeCredential, PerformanceSummary};
pub use classification::{ErrorSeverity, ErrorType, HealthStatus, RecoveryStrategy};
pub use config::{
    DatabaseConfig, DecisionConfig, EventsConfig, ExecutionConfig, FleetConfig, ManagerConfig,
    RecoveryConfig, ReliabilityConfig, RuntimeConfig, ShutdownConfig, SignalConfig, StateConfig,
    TradingConfig, WatchdogConfig,
};
pub use config_loader::ConfigLoader;
pub use error::{FleetError, FleetResult};
pub use events::{AlertLevel, EventBus, FleetEvent, HealthWarningKind};
pub use state::{BotState, PerformanceCounters, RuntimeStatus, StrategyDescriptor, StrategyKind};
pub use store::{BackupRecord, BackupType, FleetStore, SnapshotRecord};
pub use trading::{
    MarketConditions, MarketType, OpenOrder, OrderPurpose, OrderRequest, OrderResponse, OrderSide,
    OrderStatus, OrderType, Position, PositionSide, StrategyContext, StrategyDecision, TradeAction,
};
pub use traits::{Exchange, ExchangeConnector, ExchangeSession, MarketDataProvider, Strategy};

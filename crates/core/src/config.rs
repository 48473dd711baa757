use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration for a fleet process.
///
/// Every section is defaulted, so a partial TOML file (or none at all) still
/// produces a usable configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub manager: ManagerConfig,
    pub runtime: RuntimeConfig,
    pub recovery: RecoveryConfig,
    pub watchdog: WatchdogConfig,
    pub state: StateConfig,
    pub shutdown: ShutdownConfig,
    pub trading: TradingConfig,
    pub reliability: ReliabilityConfig,
    pub database: DatabaseConfig,
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub max_concurrent_bots: usize,
    pub health_check_interval_secs: u64,
    /// A running bot without a tick for this long is reported as stale.
    pub stale_tick_threshold_secs: u64,
    /// Error/tick ratio above which the health sweep warns.
    pub max_error_ratio: f64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_bots: 10,
            health_check_interval_secs: 60,
            stale_tick_threshold_secs: 300,
            max_error_ratio: 0.1,
        }
    }
}

impl ManagerConfig {
    #[must_use]
    pub const fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    #[must_use]
    pub const fn stale_tick_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_tick_threshold_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub tick_interval_ms: u64,
    /// Consecutive tick failures tolerated before an unrecovered error stops the bot.
    pub max_retries: u32,
    pub error_base_delay_ms: u64,
    pub error_max_delay_ms: u64,
    /// Persist an incremental snapshot after every successful tick.
    pub persist_every_tick: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 5_000,
            max_retries: 3,
            error_base_delay_ms: 1_000,
            error_max_delay_ms: 60_000,
            persist_every_tick: true,
        }
    }
}

impl RuntimeConfig {
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Delay before the next tick after `error_count` consecutive failures.
    ///
    /// Computes `base * 2^(error_count - 1)`, capped at `error_max_delay_ms`.
    #[must_use]
    pub fn error_delay(&self, error_count: u32) -> Duration {
        backoff_delay(
            self.error_base_delay_ms,
            self.error_max_delay_ms,
            error_count,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Attempts per (bot, error type) before retry/backoff recovery gives up.
    pub max_retry_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_timeout_secs: u64,
    /// Errors per bot inside `alert_window_secs` that raise a threshold alert.
    pub alert_threshold: usize,
    pub alert_window_secs: u64,
    pub history_limit: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            base_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout_secs: 60,
            alert_threshold: 10,
            alert_window_secs: 3_600,
            history_limit: 100,
        }
    }
}

impl RecoveryConfig {
    #[must_use]
    pub const fn circuit_breaker_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_timeout_secs)
    }

    #[must_use]
    pub const fn alert_window(&self) -> Duration {
        Duration::from_secs(self.alert_window_secs)
    }

    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        backoff_delay(self.base_backoff_ms, self.max_backoff_ms, attempt)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub check_interval_secs: u64,
    pub auto_restart: bool,
    /// Consecutive unhealthy checks before a restart is attempted.
    pub restart_threshold: u32,
    pub restart_delay_ms: u64,
    /// Errors per minute at which a bot is unhealthy.
    pub max_error_rate: f64,
    pub error_rate_window_secs: u64,
    pub memory_limit_mb: f64,
    pub cpu_limit_percent: f64,
    pub heartbeat_timeout_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            auto_restart: true,
            restart_threshold: 3,
            restart_delay_ms: 2_000,
            max_error_rate: 5.0,
            error_rate_window_secs: 300,
            memory_limit_mb: 512.0,
            cpu_limit_percent: 80.0,
            heartbeat_timeout_secs: 120,
        }
    }
}

impl WatchdogConfig {
    #[must_use]
    pub const fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    #[must_use]
    pub const fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    #[must_use]
    pub const fn error_rate_window(&self) -> Duration {
        Duration::from_secs(self.error_rate_window_secs)
    }

    #[must_use]
    pub const fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Payloads larger than this many bytes are gzip-compressed.
    pub compression_threshold_bytes: usize,
    pub verify_checksum: bool,
    pub backup_retention: usize,
    pub backup_interval_secs: u64,
    pub scheduled_backups: bool,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            compression_threshold_bytes: 4_096,
            verify_checksum: true,
            backup_retention: 10,
            backup_interval_secs: 3_600,
            scheduled_backups: true,
        }
    }
}

impl StateConfig {
    #[must_use]
    pub const fn backup_interval(&self) -> Duration {
        Duration::from_secs(self.backup_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Hard upper bound for the whole step sequence.
    pub grace_period_secs: u64,
    pub step_timeout_ms: u64,
    pub max_step_retries: u32,
    pub retry_base_delay_ms: u64,
    pub force_terminate_delay_ms: u64,
    pub cancel_orders_on_stop: bool,
    pub close_positions_on_stop: bool,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 30,
            step_timeout_ms: 5_000,
            max_step_retries: 3,
            retry_base_delay_ms: 500,
            force_terminate_delay_ms: 5_000,
            cancel_orders_on_stop: true,
            close_positions_on_stop: true,
        }
    }
}

impl ShutdownConfig {
    #[must_use]
    pub const fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    #[must_use]
    pub const fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    #[must_use]
    pub const fn force_terminate_delay(&self) -> Duration {
        Duration::from_millis(self.force_terminate_delay_ms)
    }

    #[must_use]
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        backoff_delay(self.retry_base_delay_ms, u64::MAX, attempt)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    pub signals: SignalConfig,
    pub decision: DecisionConfig,
    pub execution: ExecutionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub min_confidence: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.6,
        }
    }
}

/// Gates applied by the trade decision engine.
///
/// Percentages are expressed as percent values (`2` means 2%).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    pub max_positions: usize,
    pub max_spread_pct: Decimal,
    pub min_liquidity: Decimal,
    /// Notional committed at a suggested size fraction of 1.0.
    pub base_position_notional: Decimal,
    pub stop_loss_pct: Decimal,
    pub take_profit_pct: Decimal,
    pub slippage_tolerance_pct: Decimal,
    pub max_trade_cost: Decimal,
    pub max_risk_score: f64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            max_positions: 5,
            max_spread_pct: Decimal::new(5, 1),
            min_liquidity: Decimal::from(10_000),
            base_position_notional: Decimal::from(1_000),
            stop_loss_pct: Decimal::from(2),
            take_profit_pct: Decimal::from(4),
            slippage_tolerance_pct: Decimal::new(1, 1),
            max_trade_cost: Decimal::from(10_000),
            max_risk_score: 0.8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub max_order_retries: u32,
    pub retry_base_delay_ms: u64,
    pub exchange_timeout_ms: u64,
    pub order_timeout_secs: u64,
    pub monitor_interval_secs: u64,
    pub track_positions: bool,
    pub place_protective_orders: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_order_retries: 3,
            retry_base_delay_ms: 500,
            exchange_timeout_ms: 10_000,
            order_timeout_secs: 300,
            monitor_interval_secs: 5,
            track_positions: true,
            place_protective_orders: true,
        }
    }
}

impl ExecutionConfig {
    #[must_use]
    pub const fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }

    #[must_use]
    pub const fn order_timeout(&self) -> Duration {
        Duration::from_secs(self.order_timeout_secs)
    }

    #[must_use]
    pub const fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    #[must_use]
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        backoff_delay(self.retry_base_delay_ms, u64::MAX, attempt)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilityConfig {
    pub failover_enabled: bool,
    /// Unrecoverable errors across the fleet inside the window that trigger failover.
    pub failover_error_threshold: usize,
    pub failover_window_secs: u64,
    pub alert_cooldown_secs: u64,
    pub health_report_interval_secs: u64,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            failover_enabled: true,
            failover_error_threshold: 20,
            failover_window_secs: 300,
            alert_cooldown_secs: 300,
            health_report_interval_secs: 60,
        }
    }
}

impl ReliabilityConfig {
    #[must_use]
    pub const fn failover_window(&self) -> Duration {
        Duration::from_secs(self.failover_window_secs)
    }

    #[must_use]
    pub const fn alert_cooldown(&self) -> Duration {
        Duration::from_secs(self.alert_cooldown_secs)
    }

    #[must_use]
    pub const fn health_report_interval(&self) -> Duration {
        Duration::from_secs(self.health_report_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://bot-fleet.db?mode=rwc".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1_024,
        }
    }
}

/// Exponential backoff: `base_ms * 2^(attempt - 1)`, capped at `max_ms`.
///
/// Attempt 0 is treated as attempt 1.
#[must_use]
pub fn backoff_delay(base_ms: u64, max_ms: u64, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let factor = 1u64 << exponent;
    Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(1_000, 60_000, 0), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(1_000, 60_000, 1), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(1_000, 60_000, 2), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(1_000, 60_000, 4), Duration::from_millis(8_000));
        assert_eq!(backoff_delay(1_000, 60_000, 10), Duration::from_millis(60_000));
        assert_eq!(backoff_delay(1_000, 60_000, 500), Duration::from_millis(60_000));
    }

    #[test]
    fn test_runtime_error_delay() {
        let runtime = RuntimeConfig {
            error_base_delay_ms: 100,
            error_max_delay_ms: 1_000,
            ..RuntimeConfig::default()
        };
        assert_eq!(runtime.error_delay(3), Duration::from_millis(400));
        assert_eq!(runtime.error_delay(5), Duration::from_millis(1_000));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        use figment::providers::Format;

        let config: FleetConfig = figment::Figment::new()
            .merge(figment::providers::Toml::string(
                "[manager]\nmax_concurrent_bots = 3\n[watchdog]\nrestart_threshold = 5\n",
            ))
            .extract()
            .unwrap();

        assert_eq!(config.manager.max_concurrent_bots, 3);
        assert_eq!(config.manager.health_check_interval_secs, 60);
        assert_eq!(config.watchdog.restart_threshold, 5);
        assert_eq!(config.recovery.history_limit, 100);
    }
}

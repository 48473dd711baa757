use crate::trading::{OpenOrder, OrderSide, Position, PositionSide};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a live runtime, as opposed to the persisted [`crate::BotStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    Initializing,
    Running,
    Paused,
    Stopping,
    Stopped,
    Error,
}

impl RuntimeStatus {
    /// Whether the runtime state machine allows moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Initializing, Self::Stopped | Self::Error)
                | (Self::Stopped | Self::Paused, Self::Running)
                | (Self::Running, Self::Paused | Self::Stopping | Self::Error)
                | (Self::Paused | Self::Error, Self::Stopping)
                | (Self::Stopping, Self::Stopped | Self::Error)
                | (Self::Error, Self::Stopped)
        )
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

impl From<RuntimeStatus> for crate::BotStatus {
    fn from(status: RuntimeStatus) -> Self {
        match status {
            RuntimeStatus::Initializing => Self::Starting,
            RuntimeStatus::Running => Self::Running,
            RuntimeStatus::Paused => Self::Paused,
            RuntimeStatus::Stopping => Self::Stopping,
            RuntimeStatus::Stopped => Self::Stopped,
            RuntimeStatus::Error => Self::Error,
        }
    }
}

impl fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    BuiltIn,
    Custom,
}

/// Name, version and kind of the strategy a bot runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyDescriptor {
    pub name: String,
    pub version: String,
    pub kind: StrategyKind,
}

impl StrategyDescriptor {
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>, kind: StrategyKind) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            kind,
        }
    }
}

/// Running counters for one bot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceCounters {
    pub ticks: u64,
    pub signals: u64,
    pub trades: u64,
    pub errors: u64,
    pub winning_trades: u64,
    pub losing_trades: u64,
    pub realized_pnl: Decimal,
    pub peak_pnl: Decimal,
    pub max_drawdown: Decimal,
}

impl PerformanceCounters {
    /// Fraction of closed trades with positive `PnL`.
    #[must_use]
    pub fn win_rate(&self) -> f64 {
        let closed = self.winning_trades + self.losing_trades;
        if closed == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = self.winning_trades as f64 / closed as f64;
        rate
    }

    /// Errors per tick. Zero before the first tick.
    #[must_use]
    pub fn error_ratio(&self) -> f64 {
        if self.ticks == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let ratio = self.errors as f64 / self.ticks as f64;
        ratio
    }

    /// Aggregate kept on the bot record.
    #[must_use]
    pub fn summary(&self) -> crate::PerformanceSummary {
        crate::PerformanceSummary {
            total_trades: self.trades,
            realized_pnl: self.realized_pnl,
            win_rate: self.win_rate(),
            max_drawdown: self.max_drawdown,
        }
    }

    /// Records realized `PnL` from a closing fill and updates drawdown.
    pub fn record_realized(&mut self, pnl: Decimal) {
        if pnl > Decimal::ZERO {
            self.winning_trades += 1;
        } else if pnl < Decimal::ZERO {
            self.losing_trades += 1;
        }
        self.realized_pnl += pnl;
        if self.realized_pnl > self.peak_pnl {
            self.peak_pnl = self.realized_pnl;
        }
        let drawdown = self.peak_pnl - self.realized_pnl;
        if drawdown > self.max_drawdown {
            self.max_drawdown = drawdown;
        }
    }
}

/// Working state of one bot, owned by its runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotState {
    pub bot_id: String,
    pub status: RuntimeStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub last_tick_at: Option<DateTime<Utc>>,
    /// Consecutive failed ticks. Cleared by a successful tick.
    pub error_count: u32,
    pub last_error: Option<String>,
    pub performance: PerformanceCounters,
    pub positions: Vec<Position>,
    pub open_orders: Vec<OpenOrder>,
    pub strategy: StrategyDescriptor,
}

impl BotState {
    #[must_use]
    pub fn new(bot_id: impl Into<String>, strategy: StrategyDescriptor) -> Self {
        Self {
            bot_id: bot_id.into(),
            status: RuntimeStatus::Initializing,
            started_at: None,
            last_tick_at: None,
            error_count: 0,
            last_error: None,
            performance: PerformanceCounters::default(),
            positions: Vec::new(),
            open_orders: Vec::new(),
            strategy,
        }
    }

    #[must_use]
    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.iter().find(|p| p.symbol == symbol)
    }

    /// Applies an executed fill to the open positions.
    ///
    /// Returns the realized `PnL` when the fill reduces or closes a position,
    /// `None` when it opens or adds to one. A fill larger than the opposing
    /// position flips it.
    pub fn apply_fill(
        &mut self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        at: DateTime<Utc>,
    ) -> Option<Decimal> {
        let fill_side = PositionSide::from(side);
        let Some(index) = self.positions.iter().position(|p| p.symbol == symbol) else {
            self.positions.push(Position {
                symbol: symbol.to_string(),
                side: fill_side,
                quantity,
                entry_price: price,
                stop_loss: None,
                take_profit: None,
                opened_at: at,
            });
            return None;
        };

        let position = &mut self.positions[index];
        if position.side == fill_side {
            let cost = position.entry_price * position.quantity + price * quantity;
            position.quantity += quantity;
            position.entry_price = cost / position.quantity;
            return None;
        }

        let closed = quantity.min(position.quantity);
        let pnl = position.pnl_for(closed, price);
        let remainder = quantity - closed;
        position.quantity -= closed;

        if position.quantity.is_zero() {
            self.positions.remove(index);
            if remainder > Decimal::ZERO {
                self.positions.push(Position {
                    symbol: symbol.to_string(),
                    side: fill_side,
                    quantity: remainder,
                    entry_price: price,
                    stop_loss: None,
                    take_profit: None,
                    opened_at: at,
                });
            }
        }

        self.performance.record_realized(pnl);
        Some(pnl)
    }
}

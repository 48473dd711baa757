use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketType {
    Spot,
    Futures,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    StopLoss,
    TakeProfit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Failed,
}

impl OrderStatus {
    /// No further fills can happen.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Rejected | Self::Failed
        )
    }
}

/// Order submitted to an exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub market_type: MarketType,
}

/// Exchange acknowledgement or order lookup result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResponse {
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub average_price: Option<Decimal>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Side that opens a position of this direction.
    #[must_use]
    pub const fn entry_side(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Buy,
            Self::Short => OrderSide::Sell,
        }
    }
}

impl From<OrderSide> for PositionSide {
    fn from(side: OrderSide) -> Self {
        match side {
            OrderSide::Buy => Self::Long,
            OrderSide::Sell => Self::Short,
        }
    }
}

/// Open position held by a bot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// `PnL` if the whole position were closed at `price`.
    #[must_use]
    pub fn pnl_at(&self, price: Decimal) -> Decimal {
        self.pnl_for(self.quantity, price)
    }

    /// `PnL` realized by closing `quantity` at `price`.
    #[must_use]
    pub fn pnl_for(&self, quantity: Decimal, price: Decimal) -> Decimal {
        match self.side {
            PositionSide::Long => (price - self.entry_price) * quantity,
            PositionSide::Short => (self.entry_price - price) * quantity,
        }
    }
}

/// Why an order was placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderPurpose {
    Entry,
    Exit,
    StopLoss,
    TakeProfit,
}

/// Order tracked by a bot until it reaches a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub status: OrderStatus,
    pub purpose: OrderPurpose,
    pub market_type: MarketType,
    pub placed_at: DateTime<Utc>,
}

/// Top-of-book view used to gate trades.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketConditions {
    pub symbol: String,
    pub is_open: bool,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last_price: Decimal,
    /// Quote-currency depth available near the touch.
    pub liquidity: Decimal,
}

impl MarketConditions {
    #[must_use]
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }

    /// Spread as a percentage of mid. Zero when the book is empty.
    #[must_use]
    pub fn spread_pct(&self) -> Decimal {
        let mid = self.mid();
        if mid.is_zero() {
            return Decimal::ZERO;
        }
        (self.ask - self.bid) / mid * Decimal::ONE_HUNDRED
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeAction {
    Buy,
    Sell,
    Hold,
    Close,
}

impl TradeAction {
    #[must_use]
    pub const fn is_actionable(self) -> bool {
        !matches!(self, Self::Hold)
    }
}

/// Result of one strategy execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyDecision {
    pub action: TradeAction,
    pub confidence: f64,
    pub reason: String,
    pub symbol: Option<String>,
    /// Limit price; market order when absent.
    pub price: Option<Decimal>,
    /// Explicit quantity; sized by the decision engine when absent.
    pub quantity: Option<Decimal>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl StrategyDecision {
    #[must_use]
    pub fn hold(reason: impl Into<String>) -> Self {
        Self {
            action: TradeAction::Hold,
            confidence: 0.0,
            reason: reason.into(),
            symbol: None,
            price: None,
            quantity: None,
            metadata: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn new(action: TradeAction, symbol: impl Into<String>, confidence: f64) -> Self {
        Self {
            action,
            confidence,
            reason: String::new(),
            symbol: Some(symbol.into()),
            price: None,
            quantity: None,
            metadata: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    #[must_use]
    pub const fn with_quantity(mut self, quantity: Decimal) -> Self {
        self.quantity = Some(quantity);
        self
    }
}

/// Everything a strategy sees on one tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyContext {
    pub bot_id: String,
    pub symbol: String,
    pub configuration: serde_json::Value,
    pub positions: Vec<Position>,
    pub open_orders: Vec<OpenOrder>,
    pub market: Option<MarketConditions>,
    pub tick: u64,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_spread_pct() {
        let market = MarketConditions {
            symbol: "BTC-USD".into(),
            is_open: true,
            bid: dec!(99),
            ask: dec!(101),
            last_price: dec!(100),
            liquidity: dec!(50000),
        };
        assert_eq!(market.mid(), dec!(100));
        assert_eq!(market.spread_pct(), dec!(2));
    }

    #[test]
    fn test_position_pnl_by_side() {
        let long = Position {
            symbol: "ETH-USD".into(),
            side: PositionSide::Long,
            quantity: dec!(2),
            entry_price: dec!(100),
            stop_loss: None,
            take_profit: None,
            opened_at: Utc::now(),
        };
        let short = Position {
            side: PositionSide::Short,
            ..long.clone()
        };

        assert_eq!(long.pnl_at(dec!(110)), dec!(20));
        assert_eq!(short.pnl_at(dec!(110)), dec!(-20));
        assert_eq!(long.pnl_for(dec!(1), dec!(90)), dec!(-10));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(!OrderStatus::Open.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }
}

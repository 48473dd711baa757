//! Risk-gated trade decisions.
//!
//! Entries pass five gates in order: position limits, market conditions,
//! risk adjustment, cost estimation and the final threshold. Exits (close
//! actions, or a signal against the open position) only need an open market.

use super::signal::ValidatedSignal;
use bot_fleet_core::{
    BotState, DecisionConfig, OrderPurpose, OrderSide, OrderType, PositionSide, TradeAction,
};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

/// Approved order plan handed to the executor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradePlan {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    /// Limit price; `None` for market orders.
    pub limit_price: Option<Decimal>,
    pub reference_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub estimated_cost: Decimal,
    pub risk_score: f64,
    pub purpose: OrderPurpose,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecisionRejection {
    #[error("position limit reached ({max})")]
    PositionLimit { max: usize },
    #[error("position already open in {0}")]
    ExistingPosition(String),
    #[error("no open position to close in {0}")]
    NothingToClose(String),
    #[error("market closed for {0}")]
    MarketClosed(String),
    #[error("spread {spread_pct}% exceeds {max}%")]
    SpreadTooWide { spread_pct: Decimal, max: Decimal },
    #[error("liquidity {liquidity} below {min}")]
    InsufficientLiquidity { liquidity: Decimal, min: Decimal },
    #[error("computed quantity is zero")]
    ZeroQuantity,
    #[error("estimated cost {cost} exceeds {max}")]
    CostTooHigh { cost: Decimal, max: Decimal },
    #[error("risk score {score:.2} at or above {max:.2}")]
    RiskTooHigh { score: f64, max: f64 },
}

impl DecisionRejection {
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::PositionLimit { .. } => "position_limit",
            Self::ExistingPosition(_) => "existing_position",
            Self::NothingToClose(_) => "nothing_to_close",
            Self::MarketClosed(_) => "market_closed",
            Self::SpreadTooWide { .. } => "spread_too_wide",
            Self::InsufficientLiquidity { .. } => "insufficient_liquidity",
            Self::ZeroQuantity => "zero_quantity",
            Self::CostTooHigh { .. } => "cost_too_high",
            Self::RiskTooHigh { .. } => "risk_too_high",
        }
    }
}

/// Cost components of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CostEstimate {
    pub notional: Decimal,
    pub spread_cost: Decimal,
    pub slippage_cost: Decimal,
}

impl CostEstimate {
    #[must_use]
    pub fn total(&self) -> Decimal {
        self.notional + self.spread_cost + self.slippage_cost
    }
}

pub struct TradeDecisionEngine {
    config: DecisionConfig,
}

impl TradeDecisionEngine {
    #[must_use]
    pub const fn new(config: DecisionConfig) -> Self {
        Self { config }
    }

    /// Turns a validated signal into an order plan.
    ///
    /// # Errors
    ///
    /// Returns the first failed gate as a [`DecisionRejection`].
    pub fn evaluate(
        &self,
        signal: &ValidatedSignal,
        state: &BotState,
    ) -> Result<TradePlan, DecisionRejection> {
        let held = state.position(&signal.symbol);
        let side = signal.side();

        let is_exit = match (signal.decision.action, held, side) {
            (TradeAction::Close, _, _) => true,
            (_, Some(position), Some(side)) => position.side.entry_side() != side,
            _ => false,
        };
        if is_exit {
            return self.plan_exit(signal, state);
        }
        let Some(side) = side else {
            return Err(DecisionRejection::NothingToClose(signal.symbol.clone()));
        };

        // Gate 1: position limits.
        if held.is_some() {
            return Err(DecisionRejection::ExistingPosition(signal.symbol.clone()));
        }
        if state.positions.len() >= self.config.max_positions {
            return Err(DecisionRejection::PositionLimit {
                max: self.config.max_positions,
            });
        }

        // Gate 2: market conditions.
        let market = &signal.market;
        if !market.is_open {
            return Err(DecisionRejection::MarketClosed(signal.symbol.clone()));
        }
        let spread_pct = market.spread_pct();
        if spread_pct > self.config.max_spread_pct {
            return Err(DecisionRejection::SpreadTooWide {
                spread_pct: spread_pct.round_dp(4),
                max: self.config.max_spread_pct,
            });
        }
        if market.liquidity < self.config.min_liquidity {
            return Err(DecisionRejection::InsufficientLiquidity {
                liquidity: market.liquidity,
                min: self.config.min_liquidity,
            });
        }

        // Gate 3: risk adjustment.
        let quantity = self.entry_quantity(signal);
        if quantity <= Decimal::ZERO {
            return Err(DecisionRejection::ZeroQuantity);
        }
        let (stop_loss, take_profit) = self.protective_levels(PositionSide::from(side), signal.price);

        // Gate 4: cost estimation.
        let cost = self.estimate_cost(quantity, signal);

        // Gate 5: final threshold.
        let total = cost.total();
        if total > self.config.max_trade_cost {
            return Err(DecisionRejection::CostTooHigh {
                cost: total.round_dp(2),
                max: self.config.max_trade_cost,
            });
        }
        if signal.risk.risk_score >= self.config.max_risk_score {
            return Err(DecisionRejection::RiskTooHigh {
                score: signal.risk.risk_score,
                max: self.config.max_risk_score,
            });
        }

        Ok(TradePlan {
            symbol: signal.symbol.clone(),
            side,
            order_type: order_type(signal),
            quantity,
            limit_price: signal.decision.price,
            reference_price: signal.price,
            stop_loss: Some(stop_loss),
            take_profit: Some(take_profit),
            estimated_cost: total,
            risk_score: signal.risk.risk_score,
            purpose: OrderPurpose::Entry,
        })
    }

    fn plan_exit(
        &self,
        signal: &ValidatedSignal,
        state: &BotState,
    ) -> Result<TradePlan, DecisionRejection> {
        let position = state
            .position(&signal.symbol)
            .ok_or_else(|| DecisionRejection::NothingToClose(signal.symbol.clone()))?;
        if !signal.market.is_open {
            return Err(DecisionRejection::MarketClosed(signal.symbol.clone()));
        }

        let side = position.side.entry_side().opposite();
        let quantity = signal
            .decision
            .quantity
            .map_or(position.quantity, |q| q.min(position.quantity));
        let reference_price = signal.decision.price.unwrap_or(match side {
            OrderSide::Buy => signal.market.ask,
            OrderSide::Sell => signal.market.bid,
        });

        Ok(TradePlan {
            symbol: signal.symbol.clone(),
            side,
            order_type: order_type(signal),
            quantity,
            limit_price: signal.decision.price,
            reference_price,
            stop_loss: None,
            take_profit: None,
            estimated_cost: quantity * reference_price,
            risk_score: signal.risk.risk_score,
            purpose: OrderPurpose::Exit,
        })
    }

    /// Explicit quantity from the strategy, else base notional scaled by the
    /// signal's size fraction.
    fn entry_quantity(&self, signal: &ValidatedSignal) -> Decimal {
        if let Some(quantity) = signal.decision.quantity {
            return quantity;
        }
        if signal.price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (self.config.base_position_notional * signal.risk.size_fraction / signal.price).round_dp(8)
    }

    fn protective_levels(&self, side: PositionSide, price: Decimal) -> (Decimal, Decimal) {
        let sl = self.config.stop_loss_pct / Decimal::ONE_HUNDRED;
        let tp = self.config.take_profit_pct / Decimal::ONE_HUNDRED;
        match side {
            PositionSide::Long => (price * (Decimal::ONE - sl), price * (Decimal::ONE + tp)),
            PositionSide::Short => (price * (Decimal::ONE + sl), price * (Decimal::ONE - tp)),
        }
    }

    #[must_use]
    pub fn estimate_cost(&self, quantity: Decimal, signal: &ValidatedSignal) -> CostEstimate {
        let notional = quantity * signal.price;
        CostEstimate {
            notional,
            spread_cost: quantity * (signal.market.ask - signal.market.bid),
            slippage_cost: notional * self.config.slippage_tolerance_pct / Decimal::ONE_HUNDRED,
        }
    }
}

fn order_type(signal: &ValidatedSignal) -> OrderType {
    if signal.decision.price.is_some() {
        OrderType::Limit
    } else {
        OrderType::Market
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trade::signal::RiskAssessment;
    use bot_fleet_core::{MarketConditions, Position, StrategyDecision, StrategyDescriptor, StrategyKind};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn signal(action: TradeAction) -> ValidatedSignal {
        ValidatedSignal {
            decision: StrategyDecision::new(action, "BTC-USD", 0.9),
            symbol: "BTC-USD".into(),
            market: MarketConditions {
                symbol: "BTC-USD".into(),
                is_open: true,
                bid: dec!(99.9),
                ask: dec!(100.1),
                last_price: dec!(100),
                liquidity: dec!(50000),
            },
            price: dec!(100),
            risk: RiskAssessment {
                risk_score: 0.1,
                size_fraction: dec!(0.5),
            },
        }
    }

    fn state() -> BotState {
        BotState::new(
            "bot-1",
            StrategyDescriptor::new("hold", "1.0.0", StrategyKind::BuiltIn),
        )
    }

    fn position(symbol: &str, side: PositionSide) -> Position {
        Position {
            symbol: symbol.into(),
            side,
            quantity: dec!(2),
            entry_price: dec!(90),
            stop_loss: None,
            take_profit: None,
            opened_at: Utc::now(),
        }
    }

    fn engine() -> TradeDecisionEngine {
        TradeDecisionEngine::new(DecisionConfig::default())
    }

    #[test]
    fn test_approves_long_entry_with_protective_levels() {
        let plan = engine().evaluate(&signal(TradeAction::Buy), &state()).unwrap();

        // 1000 notional * 0.5 / 100
        assert_eq!(plan.quantity, dec!(5));
        assert_eq!(plan.side, OrderSide::Buy);
        assert_eq!(plan.order_type, OrderType::Market);
        assert_eq!(plan.stop_loss, Some(dec!(98)));
        assert_eq!(plan.take_profit, Some(dec!(104)));
        // 500 notional + 5 * 0.2 spread + 0.5 slippage
        assert_eq!(plan.estimated_cost, dec!(501.5));
    }

    #[test]
    fn test_short_levels_are_mirrored() {
        let plan = engine().evaluate(&signal(TradeAction::Sell), &state()).unwrap();
        assert_eq!(plan.stop_loss, Some(dec!(102)));
        assert_eq!(plan.take_profit, Some(dec!(96)));
    }

    #[test]
    fn test_gate_order() {
        let mut full = state();
        for i in 0..5 {
            full.positions.push(position(&format!("SYM-{i}"), PositionSide::Long));
        }
        let mut closed = signal(TradeAction::Buy);
        closed.market.is_open = false;

        // Position limit is checked before market conditions.
        assert_eq!(
            engine().evaluate(&closed, &full).unwrap_err().reason(),
            "position_limit"
        );
        assert_eq!(
            engine().evaluate(&closed, &state()).unwrap_err().reason(),
            "market_closed"
        );

        let mut wide = signal(TradeAction::Buy);
        wide.market.bid = dec!(99);
        wide.market.ask = dec!(101);
        assert_eq!(
            engine().evaluate(&wide, &state()).unwrap_err().reason(),
            "spread_too_wide"
        );

        let mut thin = signal(TradeAction::Buy);
        thin.market.liquidity = dec!(10);
        assert_eq!(
            engine().evaluate(&thin, &state()).unwrap_err().reason(),
            "insufficient_liquidity"
        );
    }

    #[test]
    fn test_cost_and_risk_thresholds() {
        let mut big = signal(TradeAction::Buy);
        big.decision = big.decision.with_quantity(dec!(500));
        assert_eq!(
            engine().evaluate(&big, &state()).unwrap_err().reason(),
            "cost_too_high"
        );

        let mut risky = signal(TradeAction::Buy);
        risky.risk.risk_score = 0.8;
        assert_eq!(
            engine().evaluate(&risky, &state()).unwrap_err().reason(),
            "risk_too_high"
        );
    }

    #[test]
    fn test_existing_position_blocks_same_side_entry() {
        let mut s = state();
        s.positions.push(position("BTC-USD", PositionSide::Long));
        assert_eq!(
            engine().evaluate(&signal(TradeAction::Buy), &s).unwrap_err().reason(),
            "existing_position"
        );
    }

    #[test]
    fn test_exit_bypasses_position_limit() {
        let mut s = state();
        for i in 0..4 {
            s.positions.push(position(&format!("SYM-{i}"), PositionSide::Long));
        }
        s.positions.push(position("BTC-USD", PositionSide::Long));

        let close = engine().evaluate(&signal(TradeAction::Close), &s).unwrap();
        assert_eq!(close.purpose, OrderPurpose::Exit);
        assert_eq!(close.side, OrderSide::Sell);
        assert_eq!(close.quantity, dec!(2));
        assert_eq!(close.reference_price, dec!(99.9));

        let sell = engine().evaluate(&signal(TradeAction::Sell), &s).unwrap();
        assert_eq!(sell.purpose, OrderPurpose::Exit);

        assert_eq!(
            engine()
                .evaluate(&signal(TradeAction::Close), &state())
                .unwrap_err()
                .reason(),
            "nothing_to_close"
        );
    }
}

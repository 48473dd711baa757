use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bot_fleet_core::{PositionSide, Strategy, StrategyContext, StrategyDecision, TradeAction};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MomentumParams {
    /// Number of observed prices the move is measured over.
    pub lookback: usize,
    /// Minimum move, in percent, that counts as momentum.
    pub threshold_pct: Decimal,
}

impl Default for MomentumParams {
    fn default() -> Self {
        Self {
            lookback: 5,
            threshold_pct: Decimal::new(5, 1),
        }
    }
}

impl MomentumParams {
    /// Parses the `momentum` section of a bot configuration.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed or out-of-range parameters.
    pub fn from_configuration(configuration: &serde_json::Value) -> Result<Self> {
        let params: Self = match configuration.get("momentum") {
            Some(section) => serde_json::from_value(section.clone())
                .context("invalid momentum configuration")?,
            None => Self::default(),
        };
        if params.lookback < 2 {
            bail!("invalid momentum configuration: lookback must be at least 2");
        }
        if params.threshold_pct <= Decimal::ZERO {
            bail!("invalid momentum configuration: threshold_pct must be positive");
        }
        Ok(params)
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct MomentumState {
    prices: VecDeque<Decimal>,
    last_direction: Option<PositionSide>,
}

/// Trades in the direction of the price move over a short lookback.
///
/// Emits a signal only when the direction changes, and closes an open
/// position when momentum turns against it.
pub struct MomentumStrategy {
    params: MomentumParams,
    state: MomentumState,
}

impl MomentumStrategy {
    #[must_use]
    pub fn new(params: MomentumParams) -> Self {
        Self {
            params,
            state: MomentumState::default(),
        }
    }

    fn change_pct(&self) -> Option<Decimal> {
        let first = *self.state.prices.front()?;
        let last = *self.state.prices.back()?;
        if first.is_zero() {
            return None;
        }
        Some((last - first) / first * Decimal::ONE_HUNDRED)
    }
}

#[async_trait]
impl Strategy for MomentumStrategy {
    async fn initialize(&mut self, context: &StrategyContext) -> Result<()> {
        tracing::debug!(
            "Momentum strategy initialized for bot {} (lookback {}, threshold {}%)",
            context.bot_id,
            self.params.lookback,
            self.params.threshold_pct
        );
        Ok(())
    }

    async fn execute(&mut self, context: &StrategyContext) -> Result<StrategyDecision> {
        let Some(market) = &context.market else {
            return Ok(StrategyDecision::hold("no market data"));
        };

        self.state.prices.push_back(market.last_price);
        while self.state.prices.len() > self.params.lookback {
            self.state.prices.pop_front();
        }
        if self.state.prices.len() < self.params.lookback {
            return Ok(StrategyDecision::hold("warming up"));
        }

        let Some(change) = self.change_pct() else {
            return Ok(StrategyDecision::hold("no reference price"));
        };

        let direction = if change >= self.params.threshold_pct {
            PositionSide::Long
        } else if change <= -self.params.threshold_pct {
            PositionSide::Short
        } else {
            return Ok(StrategyDecision::hold(format!("move {change:.2}% below threshold")));
        };

        if self.state.last_direction == Some(direction) {
            return Ok(StrategyDecision::hold("no direction change"));
        }
        self.state.last_direction = Some(direction);

        let ratio = (change.abs() / (self.params.threshold_pct * Decimal::TWO))
            .to_f64()
            .unwrap_or(0.0);
        let confidence = (0.5 + ratio / 2.0).min(1.0);
        let reason = format!("{change:.2}% over {} prices", self.params.lookback);

        let holding = context
            .positions
            .iter()
            .find(|p| p.symbol == context.symbol)
            .map(|p| p.side);
        let action = match (holding, direction) {
            (Some(held), dir) if held != dir => TradeAction::Close,
            (_, PositionSide::Long) => TradeAction::Buy,
            (_, PositionSide::Short) => TradeAction::Sell,
        };

        Ok(StrategyDecision::new(action, context.symbol.clone(), confidence).with_reason(reason))
    }

    async fn cleanup(&mut self, _context: &StrategyContext) -> Result<()> {
        self.state.prices.clear();
        Ok(())
    }

    fn get_state(&self) -> serde_json::Value {
        serde_json::to_value(&self.state).unwrap_or(serde_json::Value::Null)
    }

    fn set_state(&mut self, state: serde_json::Value) -> Result<()> {
        if !state.is_null() {
            self.state =
                serde_json::from_value(state).context("momentum state has unexpected shape")?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "momentum"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bot_fleet_core::{MarketConditions, Position};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn context(price: Decimal, positions: Vec<Position>) -> StrategyContext {
        StrategyContext {
            bot_id: "bot-1".into(),
            symbol: "BTC-USD".into(),
            configuration: serde_json::json!({}),
            positions,
            open_orders: Vec::new(),
            market: Some(MarketConditions {
                symbol: "BTC-USD".into(),
                is_open: true,
                bid: price - dec!(1),
                ask: price + dec!(1),
                last_price: price,
                liquidity: dec!(100000),
            }),
            tick: 0,
            timestamp: Utc::now(),
        }
    }

    fn strategy() -> MomentumStrategy {
        MomentumStrategy::new(MomentumParams {
            lookback: 3,
            threshold_pct: dec!(1),
        })
    }

    #[tokio::test]
    async fn test_buys_on_upward_move_once() {
        let mut s = strategy();
        for price in [dec!(100), dec!(101)] {
            let d = s.execute(&context(price, vec![])).await.unwrap();
            assert_eq!(d.action, TradeAction::Hold);
        }
        let d = s.execute(&context(dec!(102), vec![])).await.unwrap();
        assert_eq!(d.action, TradeAction::Buy);
        assert!(d.confidence >= 0.5);

        let d = s.execute(&context(dec!(104), vec![])).await.unwrap();
        assert_eq!(d.action, TradeAction::Hold);
    }

    #[tokio::test]
    async fn test_closes_long_on_reversal() {
        let mut s = strategy();
        for price in [dec!(100), dec!(101), dec!(102)] {
            s.execute(&context(price, vec![])).await.unwrap();
        }
        let long = Position {
            symbol: "BTC-USD".into(),
            side: PositionSide::Long,
            quantity: dec!(1),
            entry_price: dec!(102),
            stop_loss: None,
            take_profit: None,
            opened_at: Utc::now(),
        };
        s.execute(&context(dec!(100), vec![long.clone()])).await.unwrap();
        let d = s.execute(&context(dec!(98), vec![long])).await.unwrap();
        assert_eq!(d.action, TradeAction::Close);
    }

    #[tokio::test]
    async fn test_state_survives_round_trip() {
        let mut s = strategy();
        s.execute(&context(dec!(100), vec![])).await.unwrap();
        let saved = s.get_state();

        let mut restored = strategy();
        restored.set_state(saved).unwrap();
        assert_eq!(restored.state.prices.len(), 1);
        assert!(restored.set_state(serde_json::json!({"prices": "x"})).is_err());
    }

    #[test]
    fn test_params_validation() {
        let params =
            MomentumParams::from_configuration(&serde_json::json!({"momentum": {"lookback": 8}}))
                .unwrap();
        assert_eq!(params.lookback, 8);
        assert_eq!(params.threshold_pct, dec!(0.5));

        let err = MomentumParams::from_configuration(&serde_json::json!({"momentum": {"lookback": 1}}))
            .unwrap_err();
        assert!(err.to_string().contains("lookback"));
    }
}

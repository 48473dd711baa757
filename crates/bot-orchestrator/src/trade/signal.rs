//! Validation and enrichment of strategy output.

use bot_fleet_core::{MarketConditions, OrderSide, SignalConfig, StrategyDecision, TradeAction};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

/// Risk view attached to a validated signal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskAssessment {
    /// 0.0 (safe) to 1.0 (maximal risk).
    pub risk_score: f64,
    /// Fraction of the base notional the signal warrants.
    pub size_fraction: Decimal,
}

/// Strategy decision that passed validation, with market context attached.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidatedSignal {
    pub decision: StrategyDecision,
    pub symbol: String,
    pub market: MarketConditions,
    /// Expected execution price: the decision's limit price, else the touch.
    pub price: Decimal,
    pub risk: RiskAssessment,
}

impl ValidatedSignal {
    /// Order side for entry actions. `None` for `Close`.
    #[must_use]
    pub const fn side(&self) -> Option<OrderSide> {
        match self.decision.action {
            TradeAction::Buy => Some(OrderSide::Buy),
            TradeAction::Sell => Some(OrderSide::Sell),
            TradeAction::Hold | TradeAction::Close => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SignalRejection {
    #[error("hold signals are not traded")]
    Hold,
    #[error("confidence {confidence:.2} below minimum {min:.2}")]
    LowConfidence { confidence: f64, min: f64 },
    #[error("signal has no symbol")]
    MissingSymbol,
    #[error("market data is for {actual}, signal is for {expected}")]
    SymbolMismatch { expected: String, actual: String },
}

pub struct SignalProcessor {
    config: SignalConfig,
}

impl SignalProcessor {
    #[must_use]
    pub const fn new(config: SignalConfig) -> Self {
        Self { config }
    }

    /// Checks that a decision is worth acting on.
    ///
    /// # Errors
    ///
    /// Returns the first [`SignalRejection`] that applies.
    pub fn validate(&self, decision: &StrategyDecision) -> Result<String, SignalRejection> {
        if !decision.action.is_actionable() {
            return Err(SignalRejection::Hold);
        }
        if decision.confidence < self.config.min_confidence {
            return Err(SignalRejection::LowConfidence {
                confidence: decision.confidence,
                min: self.config.min_confidence,
            });
        }
        match decision.symbol.as_deref() {
            Some(symbol) if !symbol.is_empty() => Ok(symbol.to_string()),
            _ => Err(SignalRejection::MissingSymbol),
        }
    }

    /// Validates and attaches price and risk.
    ///
    /// # Errors
    ///
    /// Returns a [`SignalRejection`] if validation fails or `market` is for a
    /// different symbol.
    pub fn process(
        &self,
        decision: &StrategyDecision,
        market: &MarketConditions,
    ) -> Result<ValidatedSignal, SignalRejection> {
        let symbol = self.validate(decision)?;
        if market.symbol != symbol {
            return Err(SignalRejection::SymbolMismatch {
                expected: symbol,
                actual: market.symbol.clone(),
            });
        }

        let price = decision.price.unwrap_or(match decision.action {
            TradeAction::Sell => market.bid,
            TradeAction::Buy | TradeAction::Close | TradeAction::Hold => market.ask,
        });

        Ok(ValidatedSignal {
            decision: decision.clone(),
            symbol,
            market: market.clone(),
            price,
            risk: assess_risk(decision.confidence, market),
        })
    }
}

/// Risk grows as confidence falls and as the spread widens (saturating at 2%).
fn assess_risk(confidence: f64, market: &MarketConditions) -> RiskAssessment {
    let confidence = confidence.clamp(0.0, 1.0);
    let spread = market.spread_pct().to_f64().unwrap_or(0.0);
    let spread_component = (spread / 2.0).clamp(0.0, 1.0);

    let risk_score = (0.7 * (1.0 - confidence) + 0.3 * spread_component).clamp(0.0, 1.0);
    let size_fraction = Decimal::from_f64(confidence * (1.0 - risk_score))
        .unwrap_or(Decimal::ZERO)
        .round_dp(4);

    RiskAssessment {
        risk_score,
        size_fraction,
    }
}

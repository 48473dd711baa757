//! Per-tick trade pipeline: signal validation, decision gating and execution.

mod decision;
mod executor;
mod signal;

pub use decision::{CostEstimate, DecisionRejection, TradeDecisionEngine, TradePlan};
pub use executor::{ExecutionReport, MonitorSummary, TradeExecutor};
pub use signal::{RiskAssessment, SignalProcessor, SignalRejection, ValidatedSignal};

use anyhow::Result;
use async_trait::async_trait;
use bot_fleet_core::{Strategy, StrategyContext, StrategyDecision};
use serde::{Deserialize, Serialize};

/// Never trades. Useful as a placeholder and for exercising the runtime loop.
#[derive(Debug, Default)]
pub struct HoldStrategy {
    state: HoldState,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct HoldState {
    ticks_seen: u64,
}

impl HoldStrategy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Strategy for HoldStrategy {
    async fn initialize(&mut self, context: &StrategyContext) -> Result<()> {
        tracing::debug!("Hold strategy initialized for bot {}", context.bot_id);
        Ok(())
    }

    async fn execute(&mut self, _context: &StrategyContext) -> Result<StrategyDecision> {
        self.state.ticks_seen += 1;
        Ok(StrategyDecision::hold("hold strategy never trades"))
    }

    async fn cleanup(&mut self, _context: &StrategyContext) -> Result<()> {
        Ok(())
    }

    fn get_state(&self) -> serde_json::Value {
        serde_json::to_value(&self.state).unwrap_or(serde_json::Value::Null)
    }

    fn set_state(&mut self, state: serde_json::Value) -> Result<()> {
        if !state.is_null() {
            self.state = serde_json::from_value(state)?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "hold"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }
}

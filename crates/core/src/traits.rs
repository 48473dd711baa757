use crate::bot::{Bot, ExchangeCredential};
use crate::state::{StrategyDescriptor, StrategyKind};
use crate::trading::{
    MarketConditions, MarketType, OrderRequest, OrderResponse, StrategyContext, StrategyDecision,
};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Trading strategy driven by a bot runtime.
///
/// The runtime owns the strategy exclusively and calls it from one task at a
/// time, hence `&mut self`.
#[async_trait]
pub trait Strategy: Send + Sync {
    async fn initialize(&mut self, context: &StrategyContext) -> Result<()>;

    async fn execute(&mut self, context: &StrategyContext) -> Result<StrategyDecision>;

    async fn cleanup(&mut self, context: &StrategyContext) -> Result<()>;

    /// Opaque internal state, persisted with snapshots and carried across swaps.
    fn get_state(&self) -> serde_json::Value;

    /// Restores state produced by [`Strategy::get_state`].
    ///
    /// # Errors
    ///
    /// Returns an error if the blob does not match what the strategy expects.
    fn set_state(&mut self, state: serde_json::Value) -> Result<()>;

    fn name(&self) -> &str;

    fn version(&self) -> &str;

    fn kind(&self) -> StrategyKind {
        StrategyKind::BuiltIn
    }

    fn descriptor(&self) -> StrategyDescriptor {
        StrategyDescriptor::new(self.name(), self.version(), self.kind())
    }
}

/// Abstract order-placement contract.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResponse>;

    /// Returns `false` when the order was already terminal.
    async fn cancel_order(&self, order_id: &str, symbol: &str, market_type: MarketType)
        -> Result<bool>;

    async fn get_order(
        &self,
        order_id: &str,
        symbol: &str,
        market_type: MarketType,
    ) -> Result<OrderResponse>;
}

#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn market_conditions(&self, symbol: &str) -> Result<MarketConditions>;
}

/// Exchange and market-data handles for one bot.
#[derive(Clone)]
pub struct ExchangeSession {
    pub exchange: Arc<dyn Exchange>,
    pub market_data: Arc<dyn MarketDataProvider>,
}

/// Opens exchange sessions for bots.
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    async fn connect(&self, bot: &Bot, credential: &ExchangeCredential) -> Result<ExchangeSession>;
}

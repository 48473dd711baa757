//! Order submission, position tracking and the open-order monitor.

use super::decision::TradePlan;
use anyhow::{anyhow, bail, Context, Result};
use bot_fleet_core::{
    BotState, EventBus, Exchange, ExecutionConfig, FleetEvent, MarketType, OpenOrder, OrderPurpose,
    OrderRequest, OrderResponse, OrderStatus, OrderType, Position,
};
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Result of executing one plan.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub order: OrderResponse,
    pub filled: bool,
    /// Set when the fill reduced or closed a position.
    pub realized_pnl: Option<Decimal>,
    pub protective_orders: Vec<String>,
}

/// What one monitor pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorSummary {
    pub filled: usize,
    pub dropped: usize,
    pub timed_out: usize,
}

pub struct TradeExecutor {
    bot_id: String,
    config: ExecutionConfig,
    exchange: Arc<dyn Exchange>,
    market_type: MarketType,
    events: EventBus,
    deadlines: Mutex<HashMap<String, Instant>>,
    sequence: AtomicU64,
}

impl TradeExecutor {
    #[must_use]
    pub fn new(
        bot_id: impl Into<String>,
        config: ExecutionConfig,
        exchange: Arc<dyn Exchange>,
        market_type: MarketType,
        events: EventBus,
    ) -> Self {
        Self {
            bot_id: bot_id.into(),
            config,
            exchange,
            market_type,
            events,
            deadlines: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
        }
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Submits the plan and records the outcome in `state`.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange rejects the order or every attempt fails.
    pub async fn execute(&self, plan: &TradePlan, state: &Mutex<BotState>) -> Result<ExecutionReport> {
        let request = self.prepare(plan);

        let response = match self.submit(&request).await {
            Ok(response) => response,
            Err(e) => {
                self.events.publish(FleetEvent::TradeFailed {
                    bot_id: self.bot_id.clone(),
                    symbol: plan.symbol.clone(),
                    reason: format!("{e:#}"),
                });
                return Err(e);
            }
        };

        if matches!(
            response.status,
            OrderStatus::Rejected | OrderStatus::Failed | OrderStatus::Cancelled
        ) {
            let reason = format!("exchange returned {:?} for order {}", response.status, response.order_id);
            self.events.publish(FleetEvent::TradeFailed {
                bot_id: self.bot_id.clone(),
                symbol: plan.symbol.clone(),
                reason: reason.clone(),
            });
            bail!(reason);
        }

        tracing::info!(
            "Bot {} placed {:?} {:?} {} {} ({:?})",
            self.bot_id,
            plan.purpose,
            plan.side,
            plan.quantity,
            plan.symbol,
            response.status
        );
        self.events.publish(FleetEvent::TradeExecuted {
            bot_id: self.bot_id.clone(),
            order: response.clone(),
        });

        let mut report = ExecutionReport {
            order: response.clone(),
            filled: false,
            realized_pnl: None,
            protective_orders: Vec::new(),
        };

        if response.status == OrderStatus::Filled {
            report.filled = true;
            report.realized_pnl = self.settle(state, plan.purpose, &response)?;
            if plan.purpose == OrderPurpose::Entry {
                report.protective_orders = self
                    .place_protective_orders(state, &response, plan.stop_loss, plan.take_profit)
                    .await;
            }
        } else {
            self.track(state, &response, plan.purpose, plan.limit_price);
        }
        Ok(report)
    }

    fn prepare(&self, plan: &TradePlan) -> OrderRequest {
        let n = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        OrderRequest {
            client_order_id: format!("{}-{}-{n}", self.bot_id, Utc::now().timestamp_millis()),
            symbol: plan.symbol.clone(),
            side: plan.side,
            order_type: plan.order_type,
            quantity: plan.quantity,
            price: plan.limit_price,
            stop_price: None,
            market_type: self.market_type,
        }
    }

    /// Places an order with bounded retries and exponential backoff.
    async fn submit(&self, request: &OrderRequest) -> Result<OrderResponse> {
        let attempts = self.config.max_order_retries.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let result = tokio::time::timeout(
                self.config.exchange_timeout(),
                self.exchange.place_order(request),
            )
            .await
            .unwrap_or_else(|_| {
                Err(anyhow!(
                    "exchange order placement timed out after {:?}",
                    self.config.exchange_timeout()
                ))
            });

            match result {
                Ok(response) => return Ok(response),
                Err(e) => {
                    tracing::warn!(
                        "Bot {} order attempt {}/{} for {} failed: {:#}",
                        self.bot_id,
                        attempt,
                        attempts,
                        request.symbol,
                        e
                    );
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_delay(attempt)).await;
                    }
                }
            }
        }

        let error = last_error.unwrap_or_else(|| anyhow!("no order attempts made"));
        Err(error.context(format!(
            "order placement for {} failed after {} attempts",
            request.symbol, attempts
        )))
    }

    /// Applies a filled order to positions and counters.
    fn settle(
        &self,
        state: &Mutex<BotState>,
        purpose: OrderPurpose,
        response: &OrderResponse,
    ) -> Result<Option<Decimal>> {
        let price = response
            .average_price
            .ok_or_else(|| anyhow!("filled order {} has no average price", response.order_id))?;

        let mut state = state.lock();
        state.performance.trades += 1;
        state.open_orders.retain(|o| o.order_id != response.order_id);
        if !self.config.track_positions {
            return Ok(None);
        }

        let pnl = state.apply_fill(
            &response.symbol,
            response.side,
            response.filled_quantity,
            price,
            Utc::now(),
        );
        if let Some(pnl) = pnl {
            tracing::info!(
                "Bot {} realized {} on {} ({:?})",
                self.bot_id,
                pnl,
                response.symbol,
                purpose
            );
        }
        Ok(pnl)
    }

    /// Places stop-loss and take-profit orders behind a filled entry.
    ///
    /// Failures are logged; the position stays open without protection.
    async fn place_protective_orders(
        &self,
        state: &Mutex<BotState>,
        entry: &OrderResponse,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Vec<String> {
        if !self.config.place_protective_orders || !self.config.track_positions {
            return Vec::new();
        }

        let exit_side = entry.side.opposite();
        let legs = [
            (OrderType::StopLoss, OrderPurpose::StopLoss, stop_loss),
            (OrderType::TakeProfit, OrderPurpose::TakeProfit, take_profit),
        ];

        let mut placed = Vec::new();
        for (order_type, purpose, level) in legs {
            let Some(level) = level else { continue };
            let n = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
            let request = OrderRequest {
                client_order_id: format!("{}-{}-{n}", self.bot_id, purpose_tag(purpose)),
                symbol: entry.symbol.clone(),
                side: exit_side,
                order_type,
                quantity: entry.filled_quantity,
                price: None,
                stop_price: Some(level),
                market_type: self.market_type,
            };
            match self.submit(&request).await {
                Ok(response) => {
                    self.track(state, &response, purpose, Some(level));
                    placed.push(response.order_id);
                }
                Err(e) => tracing::warn!(
                    "Bot {} could not place {:?} for {}: {:#}",
                    self.bot_id,
                    purpose,
                    entry.symbol,
                    e
                ),
            }
        }

        let mut state = state.lock();
        if let Some(position) = state.positions.iter_mut().find(|p| p.symbol == entry.symbol) {
            position.stop_loss = stop_loss;
            position.take_profit = take_profit;
        }
        placed
    }

    fn track(
        &self,
        state: &Mutex<BotState>,
        response: &OrderResponse,
        purpose: OrderPurpose,
        price: Option<Decimal>,
    ) {
        let order = OpenOrder {
            order_id: response.order_id.clone(),
            symbol: response.symbol.clone(),
            side: response.side,
            order_type: response.order_type,
            quantity: response.quantity,
            price,
            status: response.status,
            purpose,
            market_type: self.market_type,
            placed_at: response.created_at,
        };
        if expires(purpose) {
            self.deadlines
                .lock()
                .insert(order.order_id.clone(), Instant::now() + self.config.order_timeout());
        }
        state.lock().open_orders.push(order);
    }

    // =========================================================================
    // Monitoring
    // =========================================================================

    /// Polls every open order once: settles fills, drops terminal orders and
    /// fails entry/exit orders past their timeout.
    pub async fn poll_orders(&self, state: &Mutex<BotState>) -> MonitorSummary {
        let orders = state.lock().open_orders.clone();
        let mut summary = MonitorSummary::default();

        for order in orders {
            if self.expired(&order) {
                self.expire(state, &order).await;
                summary.timed_out += 1;
                continue;
            }

            let lookup = tokio::time::timeout(
                self.config.exchange_timeout(),
                self.exchange
                    .get_order(&order.order_id, &order.symbol, order.market_type),
            )
            .await;
            let response = match lookup {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    tracing::debug!("Bot {} order lookup {} failed: {:#}", self.bot_id, order.order_id, e);
                    continue;
                }
                Err(_) => {
                    tracing::debug!("Bot {} order lookup {} timed out", self.bot_id, order.order_id);
                    continue;
                }
            };

            match response.status {
                OrderStatus::Filled => {
                    self.deadlines.lock().remove(&order.order_id);
                    if let Err(e) = self.settle(state, order.purpose, &response) {
                        tracing::error!("Bot {} could not settle {}: {:#}", self.bot_id, order.order_id, e);
                    }
                    if matches!(order.purpose, OrderPurpose::StopLoss | OrderPurpose::TakeProfit) {
                        self.cancel_protective_siblings(state, &order).await;
                    }
                    summary.filled += 1;
                }
                status if status.is_terminal() => {
                    self.deadlines.lock().remove(&order.order_id);
                    state.lock().open_orders.retain(|o| o.order_id != order.order_id);
                    summary.dropped += 1;
                }
                status => {
                    let mut state = state.lock();
                    if let Some(tracked) = state.open_orders.iter_mut().find(|o| o.order_id == order.order_id) {
                        tracked.status = status;
                    }
                }
            }
        }
        summary
    }

    fn expired(&self, order: &OpenOrder) -> bool {
        if !expires(order.purpose) {
            return false;
        }
        let mut deadlines = self.deadlines.lock();
        let deadline = *deadlines
            .entry(order.order_id.clone())
            .or_insert_with(|| Instant::now() + self.config.order_timeout());
        Instant::now() >= deadline
    }

    async fn expire(&self, state: &Mutex<BotState>, order: &OpenOrder) {
        tracing::warn!(
            "Bot {} order {} timed out after {:?}",
            self.bot_id,
            order.order_id,
            self.config.order_timeout()
        );
        if let Err(e) = self.cancel(order).await {
            tracing::warn!("Bot {} could not cancel expired order {}: {:#}", self.bot_id, order.order_id, e);
        }
        self.deadlines.lock().remove(&order.order_id);
        state.lock().open_orders.retain(|o| o.order_id != order.order_id);
        self.events.publish(FleetEvent::OrderTimedOut {
            bot_id: self.bot_id.clone(),
            order_id: order.order_id.clone(),
        });
    }

    /// Once one protective leg fills the other is obsolete.
    async fn cancel_protective_siblings(&self, state: &Mutex<BotState>, filled: &OpenOrder) {
        let siblings: Vec<OpenOrder> = state
            .lock()
            .open_orders
            .iter()
            .filter(|o| {
                o.symbol == filled.symbol
                    && o.order_id != filled.order_id
                    && matches!(o.purpose, OrderPurpose::StopLoss | OrderPurpose::TakeProfit)
            })
            .cloned()
            .collect();

        for sibling in siblings {
            if let Err(e) = self.cancel(&sibling).await {
                tracing::warn!("Bot {} could not cancel {}: {:#}", self.bot_id, sibling.order_id, e);
            }
            state.lock().open_orders.retain(|o| o.order_id != sibling.order_id);
        }
    }

    async fn cancel(&self, order: &OpenOrder) -> Result<bool> {
        tokio::time::timeout(
            self.config.exchange_timeout(),
            self.exchange
                .cancel_order(&order.order_id, &order.symbol, order.market_type),
        )
        .await
        .map_err(|_| anyhow!("exchange cancel of {} timed out", order.order_id))?
    }

    /// Polls open orders on an interval until `shutdown` flips.
    pub fn spawn_monitor(
        self: &Arc<Self>,
        state: Arc<Mutex<BotState>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(executor.config.monitor_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let summary = executor.poll_orders(&state).await;
                        if summary != MonitorSummary::default() {
                            tracing::debug!("Bot {} order monitor: {:?}", executor.bot_id, summary);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Order monitor for bot {} stopped", executor.bot_id);
        })
    }

    // =========================================================================
    // Shutdown helpers
    // =========================================================================

    /// Cancels every open order. Returns how many the exchange cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error naming the orders that could not be cancelled.
    pub async fn cancel_all(&self, state: &Mutex<BotState>) -> Result<usize> {
        let orders = state.lock().open_orders.clone();
        let mut cancelled = 0;
        let mut failures = Vec::new();

        for order in orders {
            match self.cancel(&order).await {
                Ok(was_open) => {
                    if was_open {
                        cancelled += 1;
                    }
                    self.deadlines.lock().remove(&order.order_id);
                    state.lock().open_orders.retain(|o| o.order_id != order.order_id);
                }
                Err(e) => failures.push(format!("{}: {e:#}", order.order_id)),
            }
        }

        if !failures.is_empty() {
            bail!("order cancellation failed for {}", failures.join("; "));
        }
        Ok(cancelled)
    }

    /// Closes every open position with a market order.
    ///
    /// # Errors
    ///
    /// Returns an error naming the positions that could not be closed.
    pub async fn close_all(&self, state: &Mutex<BotState>) -> Result<usize> {
        let positions = state.lock().positions.clone();
        let mut closed = 0;
        let mut failures = Vec::new();

        for position in positions {
            match self.close_position(state, &position).await {
                Ok(()) => closed += 1,
                Err(e) => failures.push(format!("{e:#}")),
            }
        }

        if !failures.is_empty() {
            bail!("position close failed: {}", failures.join("; "));
        }
        Ok(closed)
    }

    async fn close_position(&self, state: &Mutex<BotState>, position: &Position) -> Result<()> {
        let n = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let request = OrderRequest {
            client_order_id: format!("{}-close-{n}", self.bot_id),
            symbol: position.symbol.clone(),
            side: position.side.entry_side().opposite(),
            order_type: OrderType::Market,
            quantity: position.quantity,
            price: None,
            stop_price: None,
            market_type: self.market_type,
        };

        let response = self
            .submit(&request)
            .await
            .with_context(|| format!("closing position in {}", position.symbol))?;
        if response.status != OrderStatus::Filled {
            bail!(
                "close order {} not filled ({:?})",
                response.order_id,
                response.status
            );
        }
        self.settle(state, OrderPurpose::Exit, &response)?;
        Ok(())
    }
}

const fn expires(purpose: OrderPurpose) -> bool {
    matches!(purpose, OrderPurpose::Entry | OrderPurpose::Exit)
}

const fn purpose_tag(purpose: OrderPurpose) -> &'static str {
    match purpose {
        OrderPurpose::Entry => "entry",
        OrderPurpose::Exit => "exit",
        OrderPurpose::StopLoss => "sl",
        OrderPurpose::TakeProfit => "tp",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paper::PaperExchange;
    use bot_fleet_core::{OrderSide, PositionSide, StrategyDescriptor, StrategyKind};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn setup(config: ExecutionConfig) -> (Arc<PaperExchange>, TradeExecutor, Mutex<BotState>, EventBus) {
        let paper = Arc::new(PaperExchange::new());
        paper.set_price("BTC-USD", dec!(100), dec!(0.2));
        let events = EventBus::new(64);
        let executor = TradeExecutor::new(
            "bot-1",
            config,
            paper.clone() as Arc<dyn Exchange>,
            MarketType::Spot,
            events.clone(),
        );
        let state = Mutex::new(BotState::new(
            "bot-1",
            StrategyDescriptor::new("hold", "1.0.0", StrategyKind::BuiltIn),
        ));
        (paper, executor, state, events)
    }

    fn fast() -> ExecutionConfig {
        ExecutionConfig {
            retry_base_delay_ms: 10,
            order_timeout_secs: 60,
            ..ExecutionConfig::default()
        }
    }

    fn entry(side: OrderSide) -> TradePlan {
        TradePlan {
            symbol: "BTC-USD".into(),
            side,
            order_type: OrderType::Market,
            quantity: dec!(2),
            limit_price: None,
            reference_price: dec!(100),
            stop_loss: Some(dec!(98)),
            take_profit: Some(dec!(104)),
            estimated_cost: dec!(200),
            risk_score: 0.1,
            purpose: OrderPurpose::Entry,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_opens_position_with_protection() {
        let (_paper, executor, state, events) = setup(fast());
        let mut rx = events.subscribe();

        let report = executor.execute(&entry(OrderSide::Buy), &state).await.unwrap();

        assert!(report.filled);
        assert_eq!(report.protective_orders.len(), 2);
        let s = state.lock();
        let position = s.position("BTC-USD").unwrap();
        assert_eq!(position.side, PositionSide::Long);
        assert_eq!(position.entry_price, dec!(100.1));
        assert_eq!(position.stop_loss, Some(dec!(98)));
        assert_eq!(s.open_orders.len(), 2);
        assert_eq!(s.performance.trades, 1);
        assert_eq!(rx.try_recv().unwrap().name(), "trade-executed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let (paper, executor, state, _) = setup(fast());
        paper.fail_next_orders(2);

        let report = executor.execute(&entry(OrderSide::Buy), &state).await.unwrap();
        assert!(report.filled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail() {
        let (paper, executor, state, events) = setup(fast());
        let mut rx = events.subscribe();
        paper.fail_next_orders(10);

        let err = executor.execute(&entry(OrderSide::Buy), &state).await.unwrap_err();
        assert!(format!("{err:#}").contains("after 3 attempts"));
        assert_eq!(rx.try_recv().unwrap().name(), "trade-failed");
        assert!(state.lock().positions.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_loss_fill_closes_position_and_cancels_sibling() {
        let (paper, executor, state, _) = setup(fast());
        executor.execute(&entry(OrderSide::Buy), &state).await.unwrap();

        paper.set_price("BTC-USD", dec!(97), dec!(0.2));
        let summary = executor.poll_orders(&state).await;

        assert_eq!(summary.filled, 1);
        let s = state.lock();
        assert!(s.positions.is_empty());
        assert!(s.open_orders.is_empty());
        assert_eq!(s.performance.losing_trades, 1);
        assert_eq!(paper.open_order_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unfilled_entry_times_out() {
        let (paper, executor, state, events) = setup(fast());
        let mut rx = events.subscribe();
        paper.hold_fills(true);

        let report = executor.execute(&entry(OrderSide::Buy), &state).await.unwrap();
        assert!(!report.filled);
        assert_eq!(state.lock().open_orders.len(), 1);

        assert_eq!(executor.poll_orders(&state).await.timed_out, 0);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(executor.poll_orders(&state).await.timed_out, 1);
        assert!(state.lock().open_orders.is_empty());

        let names: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.name())
            .collect();
        assert!(names.contains(&"order-timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_close_all() {
        let (_paper, executor, state, _) = setup(fast());
        executor.execute(&entry(OrderSide::Buy), &state).await.unwrap();

        assert_eq!(executor.cancel_all(&state).await.unwrap(), 2);
        assert_eq!(executor.close_all(&state).await.unwrap(), 1);

        let s = state.lock();
        assert!(s.positions.is_empty());
        assert!(s.open_orders.is_empty());
        assert_eq!(s.performance.trades, 2);
    }
}

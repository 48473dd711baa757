//! In-memory paper exchange.
//!
//! Fills market orders at the touch using the configured book, keeps limit
//! and protective orders open until the price crosses them, and can be told
//! to fail or stall so the execution path can be exercised without a venue.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bot_fleet_core::{
    Bot, Exchange, ExchangeConnector, ExchangeCredential, ExchangeSession, MarketConditions,
    MarketDataProvider, MarketType, OrderRequest, OrderResponse, OrderSide, OrderStatus, OrderType,
};
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
struct Book {
    is_open: bool,
    bid: Decimal,
    ask: Decimal,
    last_price: Decimal,
    liquidity: Decimal,
}

#[derive(Default)]
struct PaperInner {
    books: HashMap<String, Book>,
    orders: HashMap<String, OrderResponse>,
    stop_prices: HashMap<String, Decimal>,
    fail_next: usize,
    fail_market_data: bool,
    hold_fills: bool,
}

#[derive(Default)]
pub struct PaperExchange {
    inner: Mutex<PaperInner>,
    sequence: AtomicU64,
}

impl PaperExchange {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a book around `price` with a symmetric `spread` and deep liquidity.
    pub fn set_price(&self, symbol: &str, price: Decimal, spread: Decimal) {
        let half = spread / Decimal::TWO;
        let mut inner = self.inner.lock();
        let liquidity = inner
            .books
            .get(symbol)
            .map_or(Decimal::from(1_000_000), |b| b.liquidity);
        let is_open = inner.books.get(symbol).map_or(true, |b| b.is_open);
        inner.books.insert(
            symbol.to_string(),
            Book {
                is_open,
                bid: price - half,
                ask: price + half,
                last_price: price,
                liquidity,
            },
        );
    }

    pub fn set_liquidity(&self, symbol: &str, liquidity: Decimal) {
        if let Some(book) = self.inner.lock().books.get_mut(symbol) {
            book.liquidity = liquidity;
        }
    }

    pub fn set_market_open(&self, symbol: &str, open: bool) {
        if let Some(book) = self.inner.lock().books.get_mut(symbol) {
            book.is_open = open;
        }
    }

    /// The next `count` order placements fail.
    pub fn fail_next_orders(&self, count: usize) {
        self.inner.lock().fail_next = count;
    }

    pub fn fail_market_data(&self, fail: bool) {
        self.inner.lock().fail_market_data = fail;
    }

    /// While set, market orders are acknowledged but left open.
    pub fn hold_fills(&self, hold: bool) {
        self.inner.lock().hold_fills = hold;
    }

    #[must_use]
    pub fn orders(&self) -> Vec<OrderResponse> {
        let mut orders: Vec<_> = self.inner.lock().orders.values().cloned().collect();
        orders.sort_by(|a, b| a.order_id.cmp(&b.order_id));
        orders
    }

    #[must_use]
    pub fn open_order_count(&self) -> usize {
        self.inner
            .lock()
            .orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .count()
    }

    /// Session handing out this exchange for both orders and market data.
    #[must_use]
    pub fn session(self: &Arc<Self>) -> ExchangeSession {
        ExchangeSession {
            exchange: Arc::clone(self) as Arc<dyn Exchange>,
            market_data: Arc::clone(self) as Arc<dyn MarketDataProvider>,
        }
    }

    fn next_order_id(&self) -> String {
        let n = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        format!("PAPER-{n:08}")
    }

    fn fill(order: &mut OrderResponse, price: Decimal) {
        order.status = OrderStatus::Filled;
        order.filled_quantity = order.quantity;
        order.average_price = Some(price);
    }

    /// Fills resting orders whose trigger the current book has crossed.
    fn evaluate(inner: &mut PaperInner, order_id: &str) {
        let Some(order) = inner.orders.get(order_id) else {
            return;
        };
        if order.status.is_terminal() {
            return;
        }
        let Some(book) = inner.books.get(&order.symbol) else {
            return;
        };
        let trigger = inner.stop_prices.get(order_id).copied();
        let last = book.last_price;

        let fill_price = match (order.order_type, order.side, trigger) {
            (OrderType::Market, ..) if inner.hold_fills => None,
            (OrderType::Market, OrderSide::Buy, _) => Some(book.ask),
            (OrderType::Market, OrderSide::Sell, _) => Some(book.bid),
            (OrderType::Limit, OrderSide::Buy, Some(limit)) if book.ask <= limit => Some(book.ask),
            (OrderType::Limit, OrderSide::Sell, Some(limit)) if book.bid >= limit => Some(book.bid),
            (OrderType::StopLoss, OrderSide::Sell, Some(stop)) if last <= stop => Some(last),
            (OrderType::StopLoss, OrderSide::Buy, Some(stop)) if last >= stop => Some(last),
            (OrderType::TakeProfit, OrderSide::Sell, Some(target)) if last >= target => Some(last),
            (OrderType::TakeProfit, OrderSide::Buy, Some(target)) if last <= target => Some(last),
            _ => None,
        };

        if let (Some(price), Some(order)) = (fill_price, inner.orders.get_mut(order_id)) {
            Self::fill(order, price);
            tracing::info!(
                "Paper fill {} {} {:?} {} @ {}",
                order.order_id,
                order.symbol,
                order.side,
                order.quantity,
                price
            );
        }
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResponse> {
        let mut inner = self.inner.lock();
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            bail!("exchange unavailable: simulated outage");
        }
        let book = inner
            .books
            .get(&request.symbol)
            .ok_or_else(|| anyhow!("exchange has no book for {}", request.symbol))?;
        if !book.is_open {
            bail!("exchange market closed for {}", request.symbol);
        }

        let order_id = self.next_order_id();
        let response = OrderResponse {
            order_id: order_id.clone(),
            client_order_id: request.client_order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            status: OrderStatus::Open,
            quantity: request.quantity,
            filled_quantity: Decimal::ZERO,
            average_price: None,
            created_at: Utc::now(),
        };
        inner.orders.insert(order_id.clone(), response);
        if let Some(trigger) = request.stop_price.or(request.price) {
            inner.stop_prices.insert(order_id.clone(), trigger);
        }
        Self::evaluate(&mut inner, &order_id);

        inner
            .orders
            .get(&order_id)
            .cloned()
            .ok_or_else(|| anyhow!("order {order_id} vanished"))
    }

    async fn cancel_order(
        &self,
        order_id: &str,
        _symbol: &str,
        _market_type: MarketType,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        let order = inner
            .orders
            .get_mut(order_id)
            .ok_or_else(|| anyhow!("exchange does not know order {order_id}"))?;
        if order.status.is_terminal() {
            return Ok(false);
        }
        order.status = OrderStatus::Cancelled;
        Ok(true)
    }

    async fn get_order(
        &self,
        order_id: &str,
        _symbol: &str,
        _market_type: MarketType,
    ) -> Result<OrderResponse> {
        let mut inner = self.inner.lock();
        Self::evaluate(&mut inner, order_id);
        inner
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| anyhow!("exchange does not know order {order_id}"))
    }
}

#[async_trait]
impl MarketDataProvider for PaperExchange {
    async fn market_conditions(&self, symbol: &str) -> Result<MarketConditions> {
        let inner = self.inner.lock();
        if inner.fail_market_data {
            bail!("network error: market data feed unreachable");
        }
        let book = inner
            .books
            .get(symbol)
            .ok_or_else(|| anyhow!("no market data for {symbol}"))?;
        Ok(MarketConditions {
            symbol: symbol.to_string(),
            is_open: book.is_open,
            bid: book.bid,
            ask: book.ask,
            last_price: book.last_price,
            liquidity: book.liquidity,
        })
    }
}

/// Connector that hands every bot the same paper exchange.
pub struct PaperConnector {
    exchange: Arc<PaperExchange>,
}

impl PaperConnector {
    #[must_use]
    pub const fn new(exchange: Arc<PaperExchange>) -> Self {
        Self { exchange }
    }
}

#[async_trait]
impl ExchangeConnector for PaperConnector {
    async fn connect(&self, bot: &Bot, credential: &ExchangeCredential) -> Result<ExchangeSession> {
        tracing::debug!(
            "Connecting bot {} to paper exchange {} with credential {}",
            bot.id,
            credential.exchange,
            credential.id
        );
        Ok(self.exchange.session())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request(side: OrderSide, order_type: OrderType, stop: Option<Decimal>) -> OrderRequest {
        OrderRequest {
            client_order_id: "c-1".into(),
            symbol: "BTC-USD".into(),
            side,
            order_type,
            quantity: dec!(1),
            price: None,
            stop_price: stop,
            market_type: MarketType::Spot,
        }
    }

    #[tokio::test]
    async fn test_market_order_fills_at_touch() {
        let paper = PaperExchange::new();
        paper.set_price("BTC-USD", dec!(100), dec!(2));

        let buy = paper
            .place_order(&request(OrderSide::Buy, OrderType::Market, None))
            .await
            .unwrap();
        assert_eq!(buy.status, OrderStatus::Filled);
        assert_eq!(buy.average_price, Some(dec!(101)));
    }

    #[tokio::test]
    async fn test_stop_loss_triggers_on_cross() {
        let paper = PaperExchange::new();
        paper.set_price("BTC-USD", dec!(100), dec!(0));
        let stop = paper
            .place_order(&request(OrderSide::Sell, OrderType::StopLoss, Some(dec!(95))))
            .await
            .unwrap();
        assert_eq!(stop.status, OrderStatus::Open);

        paper.set_price("BTC-USD", dec!(94), dec!(0));
        let polled = paper
            .get_order(&stop.order_id, "BTC-USD", MarketType::Spot)
            .await
            .unwrap();
        assert_eq!(polled.status, OrderStatus::Filled);
        assert!(!paper
            .cancel_order(&stop.order_id, "BTC-USD", MarketType::Spot)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let paper = PaperExchange::new();
        paper.set_price("BTC-USD", dec!(100), dec!(1));
        paper.fail_next_orders(1);

        let req = request(OrderSide::Buy, OrderType::Market, None);
        assert!(paper.place_order(&req).await.is_err());
        assert!(paper.place_order(&req).await.is_ok());

        paper.set_market_open("BTC-USD", false);
        assert!(paper.place_order(&req).await.is_err());
    }
}

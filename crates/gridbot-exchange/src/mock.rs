//! Deterministic in-memory exchange.
//!
//! Used in two places: engine/server tests, and keyless runs (no
//! `BYBIT_API_KEY` in the environment), where it synthesizes a
//! deterministic price walk so the whole system can be exercised
//! without touching a real venue.
//!
//! Fill model: a resting buy fills when the market price touches or
//! drops through its limit; a resting sell fills when the market price
//! touches or rises through its limit. Fills happen inside
//! [`MockExchange::set_price`], so tests drive the market with plain
//! price updates.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::debug;

use gridbot_core::{
    ClientOrderId, OpenOrder, OrderSide, OrderState, OrderStatus, Price, PriceTick, Qty, Symbol,
};

use crate::client::{Exchange, PlacedOrder};
use crate::error::{ExchangeError, ExchangeResult};

/// Equity reported by the mock wallet.
const MOCK_EQUITY: &str = "34000";

/// Interval between synthetic walk ticks.
const WALK_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone)]
struct MockOrder {
    order_id: String,
    symbol: Symbol,
    side: OrderSide,
    price: Price,
    qty: Qty,
    state: OrderState,
    filled_qty: Qty,
    avg_price: Price,
}

#[derive(Default)]
struct MockBook {
    orders: HashMap<String, MockOrder>,
    /// client tag -> order id, for placement idempotency.
    by_tag: HashMap<String, String>,
}

/// Deterministic in-memory exchange.
pub struct MockExchange {
    prices: Mutex<HashMap<Symbol, Price>>,
    book: Mutex<MockBook>,
    next_id: AtomicU64,
    equity: Mutex<Price>,
    /// Scripted failures: `None` keys match any operation, named keys
    /// only that operation. Consumed one per matching call.
    fail_queue: Mutex<VecDeque<(Option<&'static str>, ExchangeError)>>,
    /// Subscribers from `subscribe`.
    subscribers: Mutex<Vec<mpsc::Sender<PriceTick>>>,
    /// Whether `subscribe` spawns the synthetic walk.
    synthetic_walk: bool,
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            prices: Mutex::new(HashMap::new()),
            book: Mutex::new(MockBook::default()),
            next_id: AtomicU64::new(1),
            equity: Mutex::new(Price::new(MOCK_EQUITY.parse().expect("const decimal"))),
            fail_queue: Mutex::new(VecDeque::new()),
            subscribers: Mutex::new(Vec::new()),
            synthetic_walk: false,
        }
    }

    /// Mock for keyless runs: `subscribe` produces a deterministic
    /// price walk around each symbol's seeded price.
    pub fn with_synthetic_walk() -> Self {
        Self {
            synthetic_walk: true,
            ..Self::new()
        }
    }

    // === test drivers ===

    /// Update the market price, fill crossing orders, and publish the
    /// tick to subscribers.
    pub fn set_price(&self, symbol: &Symbol, price: Price) {
        self.prices.lock().insert(symbol.clone(), price);
        self.fill_crossing(symbol, price);
        self.publish(PriceTick::new(
            symbol.clone(),
            price,
            chrono::Utc::now().timestamp_millis(),
        ));
    }

    /// Seed a price without touching orders or subscribers.
    pub fn seed_price(&self, symbol: &Symbol, price: Price) {
        self.prices.lock().insert(symbol.clone(), price);
    }

    /// Override the reported wallet equity.
    pub fn set_equity(&self, equity: Price) {
        *self.equity.lock() = equity;
    }

    /// Script the next call (any operation) to fail with `error`.
    pub fn fail_next(&self, error: ExchangeError) {
        self.fail_queue.lock().push_back((None, error));
    }

    /// Script the next call of one operation (`"place_limit"`,
    /// `"cancel"`, `"order_status"`, `"open_orders"`, `"wallet_equity"`,
    /// `"ticker"`) to fail with `error`.
    pub fn fail_next_op(&self, op: &'static str, error: ExchangeError) {
        self.fail_queue.lock().push_back((Some(op), error));
    }

    /// Apply a partial fill to a resting order.
    pub fn partial_fill(&self, order_id: &str, fill_qty: Qty, at_price: Price) {
        let mut book = self.book.lock();
        if let Some(order) = book.orders.get_mut(order_id) {
            order.filled_qty = order.filled_qty + fill_qty;
            order.avg_price = at_price;
            order.state = if order.filled_qty >= order.qty {
                OrderState::Filled
            } else {
                OrderState::Partial
            };
        }
    }

    /// Cancel an order as if the exchange or another client dropped it.
    pub fn cancel_externally(&self, order_id: &str) {
        let mut book = self.book.lock();
        if let Some(order) = book.orders.get_mut(order_id) {
            if order.state.is_active() {
                order.state = OrderState::Cancelled;
            }
        }
    }

    /// Seed a resting order directly (crash-restart reconciliation tests).
    pub fn seed_open_order(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        price: Price,
        qty: Qty,
    ) -> String {
        let order_id = format!("mock_{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let order = MockOrder {
            order_id: order_id.clone(),
            symbol: symbol.clone(),
            side,
            price,
            qty,
            state: OrderState::New,
            filled_qty: Qty::ZERO,
            avg_price: Price::ZERO,
        };
        self.book.lock().orders.insert(order_id.clone(), order);
        order_id
    }

    /// Number of resting (active) orders for a symbol.
    pub fn open_order_count(&self, symbol: &Symbol) -> usize {
        self.book
            .lock()
            .orders
            .values()
            .filter(|o| o.symbol == *symbol && o.state.is_active())
            .count()
    }

    /// State of a specific order, if it exists.
    pub fn order_state(&self, order_id: &str) -> Option<OrderState> {
        self.book.lock().orders.get(order_id).map(|o| o.state)
    }

    // === internals ===

    fn take_scripted_failure(&self, op: &'static str) -> Option<ExchangeError> {
        let mut queue = self.fail_queue.lock();
        let pos = queue
            .iter()
            .position(|(target, _)| target.map(|t| t == op).unwrap_or(true))?;
        queue.remove(pos).map(|(_, error)| error)
    }

    fn fill_crossing(&self, symbol: &Symbol, price: Price) {
        let mut book = self.book.lock();
        for order in book.orders.values_mut() {
            if order.symbol != *symbol || !order.state.is_active() {
                continue;
            }
            let crossed = match order.side {
                OrderSide::Buy => price <= order.price,
                OrderSide::Sell => price >= order.price,
            };
            if crossed {
                debug!(order_id = %order.order_id, side = %order.side, limit = %order.price, %price, "Mock fill");
                order.state = OrderState::Filled;
                order.filled_qty = order.qty;
                order.avg_price = order.price;
            }
        }
    }

    fn publish(&self, tick: PriceTick) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.try_send(tick.clone()).is_ok());
    }
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Exchange for MockExchange {
    async fn place_limit(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        price: Price,
        qty: Qty,
        client_tag: &ClientOrderId,
    ) -> ExchangeResult<PlacedOrder> {
        if let Some(err) = self.take_scripted_failure("place_limit") {
            return Err(err);
        }
        if !qty.is_positive() || !price.is_positive() {
            return Err(ExchangeError::Invalid(format!(
                "Bad order: price={price} qty={qty}"
            )));
        }

        let mut book = self.book.lock();
        if let Some(existing) = book.by_tag.get(client_tag.as_str()) {
            // Idempotent replay under the same tag
            return Ok(PlacedOrder {
                order_id: existing.clone(),
            });
        }

        let order_id = format!("mock_{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        book.by_tag
            .insert(client_tag.as_str().to_string(), order_id.clone());
        book.orders.insert(
            order_id.clone(),
            MockOrder {
                order_id: order_id.clone(),
                symbol: symbol.clone(),
                side,
                price,
                qty,
                state: OrderState::New,
                filled_qty: Qty::ZERO,
                avg_price: Price::ZERO,
            },
        );

        Ok(PlacedOrder { order_id })
    }

    async fn cancel(&self, _symbol: &Symbol, order_id: &str) -> ExchangeResult<()> {
        if let Some(err) = self.take_scripted_failure("cancel") {
            return Err(err);
        }
        let mut book = self.book.lock();
        match book.orders.get_mut(order_id) {
            Some(order) if order.state.is_active() => {
                order.state = OrderState::Cancelled;
                Ok(())
            }
            // Idempotent: already terminal or unknown both count as done
            _ => Ok(()),
        }
    }

    async fn order_status(&self, _symbol: &Symbol, order_id: &str) -> ExchangeResult<OrderStatus> {
        if let Some(err) = self.take_scripted_failure("order_status") {
            return Err(err);
        }
        let book = self.book.lock();
        let order = book
            .orders
            .get(order_id)
            .ok_or_else(|| ExchangeError::Invalid(format!("Order {order_id} not found")))?;
        Ok(OrderStatus::new(order.state, order.filled_qty, order.avg_price))
    }

    async fn open_orders(&self, symbol: &Symbol) -> ExchangeResult<Vec<OpenOrder>> {
        if let Some(err) = self.take_scripted_failure("open_orders") {
            return Err(err);
        }
        let book = self.book.lock();
        Ok(book
            .orders
            .values()
            .filter(|o| o.symbol == *symbol && o.state.is_active())
            .map(|o| OpenOrder {
                order_id: o.order_id.clone(),
                symbol: o.symbol.clone(),
                side: o.side,
                price: o.price,
                qty: o.qty,
            })
            .collect())
    }

    async fn wallet_equity(&self) -> ExchangeResult<Price> {
        if let Some(err) = self.take_scripted_failure("wallet_equity") {
            return Err(err);
        }
        Ok(*self.equity.lock())
    }

    async fn ticker(&self, symbol: &Symbol) -> ExchangeResult<PriceTick> {
        if let Some(err) = self.take_scripted_failure("ticker") {
            return Err(err);
        }
        let price = self
            .prices
            .lock()
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::Invalid(format!("No price seeded for {symbol}")))?;
        Ok(PriceTick::new(
            symbol.clone(),
            price,
            chrono::Utc::now().timestamp_millis(),
        ))
    }

    async fn subscribe(&self, symbols: &[Symbol]) -> ExchangeResult<mpsc::Receiver<PriceTick>> {
        let (tx, rx) = mpsc::channel(1024);
        self.subscribers.lock().push(tx.clone());

        if self.synthetic_walk {
            let seeds: Vec<(Symbol, Price)> = {
                let prices = self.prices.lock();
                symbols
                    .iter()
                    .filter_map(|s| prices.get(s).map(|p| (s.clone(), *p)))
                    .collect()
            };
            tokio::spawn(run_walk(seeds, tx));
        }

        Ok(rx)
    }
}

/// Deterministic triangular price walk: ±0.2% around the seed with a
/// 40-tick period. No randomness, so keyless runs are reproducible.
async fn run_walk(seeds: Vec<(Symbol, Price)>, tx: mpsc::Sender<PriceTick>) {
    let amplitude = Decimal::new(2, 3); // 0.002
    let mut step: i64 = 0;

    loop {
        // Triangle wave over [-10, 10]
        let phase = step % 40;
        let tri = if phase < 20 { phase - 10 } else { 30 - phase };
        let factor = Decimal::ONE + amplitude * Decimal::from(tri) / Decimal::from(10);

        for (symbol, seed) in &seeds {
            let price = Price::new(seed.inner() * factor);
            let tick = PriceTick::new(
                symbol.clone(),
                price,
                chrono::Utc::now().timestamp_millis(),
            );
            if tx.send(tick).await.is_err() {
                return;
            }
        }

        step += 1;
        tokio::time::sleep(std::time::Duration::from_millis(WALK_INTERVAL_MS)).await;
    }
}

/// Convenience constructor used by the binary when no API key is set.
pub fn mock_with_default_prices() -> Arc<MockExchange> {
    let mock = Arc::new(MockExchange::with_synthetic_walk());
    let defaults = [
        ("BTCUSDT", "97250.0"),
        ("MNTUSDT", "1.08"),
        ("DOGEUSDT", "0.137"),
        ("PEPEUSDT", "0.00000445"),
    ];
    for (symbol, price) in defaults {
        mock.seed_price(
            &Symbol::new(symbol),
            Price::new(price.parse().expect("const decimal")),
        );
    }
    mock
}

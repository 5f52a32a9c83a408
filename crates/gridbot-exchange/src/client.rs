//! The `Exchange` trait: the only surface the core sees.
//!
//! Production code talks to `MeteredExchange<BybitExchange>`; tests and
//! keyless runs talk to `MeteredExchange<MockExchange>`. The trait is
//! dyn-compatible so the engine holds an `Arc<dyn Exchange>`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use gridbot_core::{
    ClientOrderId, OpenOrder, OrderSide, OrderStatus, Price, PriceTick, Qty, Symbol,
};

use crate::error::ExchangeResult;

/// Result of a successful limit placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedOrder {
    /// Exchange-assigned order id.
    pub order_id: String,
}

/// Exchange capability consumed by the core.
///
/// `place_limit` is idempotent under the client tag; `cancel` treats a
/// missing order as success. Workers rely on both to retry safely.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Place a GTC limit order. Idempotent under `client_tag`: replaying
    /// the same tag returns the originally created order.
    async fn place_limit(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        price: Price,
        qty: Qty,
        client_tag: &ClientOrderId,
    ) -> ExchangeResult<PlacedOrder>;

    /// Cancel an order. An order that no longer exists counts as success.
    async fn cancel(&self, symbol: &Symbol, order_id: &str) -> ExchangeResult<()>;

    /// Point-in-time status of a single order.
    async fn order_status(&self, symbol: &Symbol, order_id: &str) -> ExchangeResult<OrderStatus>;

    /// All orders currently resting for a symbol.
    async fn open_orders(&self, symbol: &Symbol) -> ExchangeResult<Vec<OpenOrder>>;

    /// Total account equity in quote currency.
    async fn wallet_equity(&self) -> ExchangeResult<Price>;

    /// Last traded price for a symbol (REST fallback for the feed).
    async fn ticker(&self, symbol: &Symbol) -> ExchangeResult<PriceTick>;

    /// Subscribe to the streaming ticker for a set of symbols.
    ///
    /// The returned channel yields ticks until dropped or the transport
    /// dies; the feed falls back to polling `ticker` when it closes.
    async fn subscribe(&self, symbols: &[Symbol]) -> ExchangeResult<mpsc::Receiver<PriceTick>>;
}

/// Shared handle to a boxed exchange.
pub type DynExchange = Arc<dyn Exchange>;

/// Observer for call outcomes, implemented by the risk supervisor.
///
/// The metered wrapper reports every call here so the API error-rate
/// estimator sees the complete traffic, not just worker-initiated calls.
pub trait CallObserver: Send + Sync {
    fn record_call(&self, success: bool);
}

/// No-op observer for tests and tools that run without risk supervision.
#[derive(Debug, Default)]
pub struct NullObserver;

impl CallObserver for NullObserver {
    fn record_call(&self, _success: bool) {}
}

//! Metered exchange wrapper.
//!
//! Wraps any [`Exchange`] with the three cross-cutting behaviors the
//! core relies on:
//! - one global token bucket at the provider limit,
//! - a hard deadline per call (expired calls count as failed),
//! - reporting of every call outcome to the risk supervisor's
//!   error-rate estimator.
//!
//! Workers never talk to a raw transport; the controller hands them
//! this wrapper.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use gridbot_core::{
    ClientOrderId, OpenOrder, OrderSide, OrderStatus, Price, PriceTick, Qty, Symbol,
};

use crate::client::{CallObserver, DynExchange, Exchange, PlacedOrder};
use crate::error::{ExchangeError, ExchangeResult};
use crate::rate_limiter::RateLimiter;

/// Default per-call deadline.
pub const DEFAULT_CALL_DEADLINE: Duration = Duration::from_secs(30);

/// Rate-limited, deadline-bounded, observed exchange.
pub struct MeteredExchange {
    inner: DynExchange,
    limiter: Arc<RateLimiter>,
    observer: Arc<dyn CallObserver>,
    deadline: Duration,
}

impl MeteredExchange {
    pub fn new(inner: DynExchange, limiter: Arc<RateLimiter>, observer: Arc<dyn CallObserver>) -> Self {
        Self {
            inner,
            limiter,
            observer,
            deadline: DEFAULT_CALL_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Shared access to the limiter (for status surfaces).
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Run one call under the token bucket and deadline, reporting the
    /// outcome.
    async fn metered<T, F>(&self, fut: F) -> ExchangeResult<T>
    where
        F: Future<Output = ExchangeResult<T>>,
    {
        self.limiter.acquire().await;

        let result = match tokio::time::timeout(self.deadline, fut).await {
            Ok(inner) => inner,
            Err(_) => Err(ExchangeError::Transient(format!(
                "Call deadline of {:?} expired",
                self.deadline
            ))),
        };

        self.observer.record_call(result.is_ok());
        result
    }
}

#[async_trait]
impl Exchange for MeteredExchange {
    async fn place_limit(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        price: Price,
        qty: Qty,
        client_tag: &ClientOrderId,
    ) -> ExchangeResult<PlacedOrder> {
        self.metered(self.inner.place_limit(symbol, side, price, qty, client_tag))
            .await
    }

    async fn cancel(&self, symbol: &Symbol, order_id: &str) -> ExchangeResult<()> {
        self.metered(self.inner.cancel(symbol, order_id)).await
    }

    async fn order_status(&self, symbol: &Symbol, order_id: &str) -> ExchangeResult<OrderStatus> {
        self.metered(self.inner.order_status(symbol, order_id)).await
    }

    async fn open_orders(&self, symbol: &Symbol) -> ExchangeResult<Vec<OpenOrder>> {
        self.metered(self.inner.open_orders(symbol)).await
    }

    async fn wallet_equity(&self) -> ExchangeResult<Price> {
        self.metered(self.inner.wallet_equity()).await
    }

    async fn ticker(&self, symbol: &Symbol) -> ExchangeResult<PriceTick> {
        self.metered(self.inner.ticker(symbol)).await
    }

    async fn subscribe(&self, symbols: &[Symbol]) -> ExchangeResult<mpsc::Receiver<PriceTick>> {
        // The subscription itself is one call; the stream it yields is
        // push traffic and not subject to the request budget.
        self.metered(self.inner.subscribe(symbols)).await
    }
}

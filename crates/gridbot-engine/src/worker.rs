//! Grid worker actor.
//!
//! One worker task per deployed symbol. The task owns its `GridState`
//! exclusively: commands arrive on a mailbox, ticks on a dedicated
//! channel, and the kill latch on a `watch` channel polled ahead of
//! both, so a kill preempts queued work. Between awaits the state is
//! never shared, so it needs no locking.
//!
//! Epoch guard: the state's epoch is bumped on every stop/rebalance.
//! Every exchange operation captures the epoch it was issued under and
//! its result is discarded if the epoch moved on. This is the sole
//! defense against stale responses mutating a regenerated grid.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use gridbot_core::{
    ClientOrderId, OpenOrder, OrderSide, OrderState, OrderStatus, Price, PriceTick, Qty, Symbol,
};
use gridbot_exchange::{DynExchange, ExchangeError, ExchangeResult, PlacedOrder};
use gridbot_persistence::{DynStore, StoreEvent};
use gridbot_risk::{RiskSupervisor, StartCheck};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::params::GridParameters;
use crate::state::{GridSnapshot, GridState, GridStatus};

/// Attempts per exchange call before a transient error is given up on.
const RETRY_ATTEMPTS: u32 = 3;

/// Base delay of the exponential backoff between retries.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Mailbox capacity per worker.
const MAILBOX_CAPACITY: usize = 32;

// ============================================================================
// Command protocol
// ============================================================================

/// Result of `start`/`resume`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartOutcome {
    pub orders_placed: usize,
    /// Orders adopted from the exchange during reconciliation.
    pub adopted: usize,
}

/// Result of `pause`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PauseOutcome {
    pub cancelled: usize,
}

/// Result of `stop`. `remaining` lists order ids still open after best
/// effort cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopOutcome {
    pub cancelled: usize,
    pub remaining: Vec<String>,
}

/// Result of `rebalance`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebalanceOutcome {
    pub stopped: StopOutcome,
    pub started: StartOutcome,
}

enum WorkerCommand {
    Start(oneshot::Sender<EngineResult<StartOutcome>>),
    Pause(oneshot::Sender<EngineResult<PauseOutcome>>),
    Resume(oneshot::Sender<EngineResult<StartOutcome>>),
    Stop(oneshot::Sender<EngineResult<StopOutcome>>),
    Rebalance(oneshot::Sender<EngineResult<RebalanceOutcome>>),
    Snapshot(oneshot::Sender<GridSnapshot>),
}

/// Cloneable handle to one worker's mailbox.
#[derive(Clone)]
pub struct WorkerHandle {
    symbol: Symbol,
    cmd_tx: mpsc::Sender<WorkerCommand>,
}

impl WorkerHandle {
    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> WorkerCommand,
    ) -> EngineResult<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| EngineError::WorkerGone(self.symbol.clone()))?;
        rx.await
            .map_err(|_| EngineError::WorkerGone(self.symbol.clone()))
    }

    pub async fn start(&self) -> EngineResult<StartOutcome> {
        self.request(WorkerCommand::Start).await?
    }

    pub async fn pause(&self) -> EngineResult<PauseOutcome> {
        self.request(WorkerCommand::Pause).await?
    }

    pub async fn resume(&self) -> EngineResult<StartOutcome> {
        self.request(WorkerCommand::Resume).await?
    }

    pub async fn stop(&self) -> EngineResult<StopOutcome> {
        self.request(WorkerCommand::Stop).await?
    }

    pub async fn rebalance(&self) -> EngineResult<RebalanceOutcome> {
        self.request(WorkerCommand::Rebalance).await?
    }

    pub async fn snapshot(&self) -> EngineResult<GridSnapshot> {
        self.request(WorkerCommand::Snapshot).await
    }
}

/// Spawn a worker task for `params`, wired to the given tick stream.
pub fn spawn_worker(
    params: GridParameters,
    exchange: DynExchange,
    risk: Arc<RiskSupervisor>,
    store: DynStore,
    tick_rx: mpsc::Receiver<PriceTick>,
) -> WorkerHandle {
    let symbol = params.symbol.clone();
    let (cmd_tx, cmd_rx) = mpsc::channel(MAILBOX_CAPACITY);
    let kill_rx = risk.latch().subscribe();

    let worker = GridWorker {
        state: GridState::new(params),
        exchange,
        risk,
        store,
    };
    tokio::spawn(worker.run(cmd_rx, tick_rx, kill_rx));

    WorkerHandle { symbol, cmd_tx }
}

// ============================================================================
// Worker
// ============================================================================

struct GridWorker {
    state: GridState,
    exchange: DynExchange,
    risk: Arc<RiskSupervisor>,
    store: DynStore,
}

impl GridWorker {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<WorkerCommand>,
        mut tick_rx: mpsc::Receiver<PriceTick>,
        mut kill_rx: watch::Receiver<bool>,
    ) {
        let symbol = self.state.params.symbol.clone();
        debug!(%symbol, "Grid worker started");

        if *kill_rx.borrow_and_update() {
            self.state.status = GridStatus::Killed;
        }

        let mut ticks_open = true;
        loop {
            tokio::select! {
                biased;

                changed = kill_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *kill_rx.borrow_and_update() {
                        self.forced_stop().await;
                    }
                }

                tick = tick_rx.recv(), if ticks_open => {
                    match tick {
                        Some(tick) => self.handle_tick(tick).await,
                        None => {
                            warn!(%symbol, "Tick stream closed");
                            ticks_open = false;
                        }
                    }
                }

                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }
            }
        }

        debug!(%symbol, "Grid worker terminated");
    }

    async fn handle_command(&mut self, cmd: WorkerCommand) {
        match cmd {
            WorkerCommand::Start(reply) => {
                let _ = reply.send(self.handle_start(true).await);
            }
            WorkerCommand::Resume(reply) => {
                let regenerate = self.state.status != GridStatus::Paused;
                let _ = reply.send(self.handle_start(regenerate).await);
            }
            WorkerCommand::Pause(reply) => {
                let _ = reply.send(self.handle_pause().await);
            }
            WorkerCommand::Stop(reply) => {
                let _ = reply.send(Ok(self.handle_stop().await));
            }
            WorkerCommand::Rebalance(reply) => {
                let _ = reply.send(self.handle_rebalance().await);
            }
            WorkerCommand::Snapshot(reply) => {
                let _ = reply.send(self.state.snapshot());
            }
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start or resume. `regenerate` rebuilds levels from parameters
    /// (cold start, rebalance); a resume from PAUSED keeps levels so
    /// holdings survive.
    async fn handle_start(&mut self, regenerate: bool) -> EngineResult<StartOutcome> {
        let symbol = self.state.params.symbol.clone();

        if self.state.status == GridStatus::Running {
            return Err(EngineError::Blocked(format!(
                "Grid already running for {symbol}"
            )));
        }
        if self.state.stop_loss_tripped {
            return Err(EngineError::StopLossTripped(symbol));
        }
        if self.risk.latch().is_triggered() {
            let reason = self.risk.latch().reason().unwrap_or_default();
            return Err(EngineError::KilledByRisk(reason));
        }

        if self.state.current_price.is_none() {
            let tick = self
                .exchange
                .ticker(&symbol)
                .await
                .map_err(|e| EngineError::ExchangeUnavailable(e.to_string()))?;
            self.state.current_price = Some(tick.price);
            self.state.last_tick_ms = tick.ts_ms;
        }

        let gate = self.risk.allow_start(&StartCheck {
            symbol: symbol.clone(),
            current_price: self.state.current_price,
            stop_loss: self.state.params.stop_loss,
            btc_filter_enabled: self.state.params.btc_filter_enabled,
            investment: self.state.params.total_investment,
        });
        if let Some(reason) = gate.blocked_reason() {
            info!(%symbol, %reason, "Start blocked by pre-trade gate");
            return Err(EngineError::Blocked(reason.to_string()));
        }

        if regenerate || self.state.levels.is_empty() {
            self.state.build_levels();
        }

        let adopted = self.reconcile().await?;
        let orders_placed = self.place_grid_orders().await;

        self.state.status = GridStatus::Running;
        info!(%symbol, orders_placed, adopted, "Grid running");
        Ok(StartOutcome {
            orders_placed,
            adopted,
        })
    }

    /// Cancel all open orders and transition to PAUSED. Holdings are
    /// kept so a resume re-places their sells. If any cancel fails
    /// after retries the worker stays RUNNING and the error escalates.
    async fn handle_pause(&mut self) -> EngineResult<PauseOutcome> {
        let symbol = self.state.params.symbol.clone();
        // Already quiet, or frozen in KILLED: nothing to cancel, and a
        // killed worker only leaves that state through reset + start
        if matches!(
            self.state.status,
            GridStatus::Paused | GridStatus::Stopped | GridStatus::Killed
        ) {
            return Ok(PauseOutcome { cancelled: 0 });
        }

        let (cancelled, failed) = self.cancel_all_orders().await;
        if !failed.is_empty() {
            warn!(%symbol, failures = failed.len(), "Pause left orders open");
            return Err(EngineError::ExchangeUnavailable(format!(
                "{} cancels failed for {symbol}",
                failed.len()
            )));
        }

        self.state.status = GridStatus::Paused;
        info!(%symbol, cancelled, "Grid paused");
        Ok(PauseOutcome { cancelled })
    }

    /// Cancel everything, clear levels, transition to STOPPED (or stay
    /// KILLED under the latch). Bumps the epoch first so in-flight
    /// responses from the old grid are fenced off. Clears the sticky
    /// stop-loss flag: an explicit stop is the operator acknowledgement.
    async fn handle_stop(&mut self) -> StopOutcome {
        let symbol = self.state.params.symbol.clone();

        self.state.epoch += 1;

        let (cancelled, remaining) = self.cancel_all_orders().await;
        self.state.levels.clear();
        self.state.stop_loss_tripped = false;
        self.state.status = if self.risk.latch().is_triggered() {
            GridStatus::Killed
        } else {
            GridStatus::Stopped
        };

        info!(%symbol, cancelled, remaining = remaining.len(), epoch = self.state.epoch, "Grid stopped");
        StopOutcome {
            cancelled,
            remaining,
        }
    }

    /// Atomic stop + start under the same parameters. Runs inside one
    /// command, so no tick or other command interleaves the gap.
    async fn handle_rebalance(&mut self) -> EngineResult<RebalanceOutcome> {
        let stopped = self.handle_stop().await;
        let started = self.handle_start(true).await?;
        Ok(RebalanceOutcome { stopped, started })
    }

    /// Forced stop on kill. The worker lands in KILLED and stays there
    /// until the latch is reset and an explicit start arrives.
    async fn forced_stop(&mut self) {
        let symbol = self.state.params.symbol.clone();
        let reason = self.risk.latch().reason().unwrap_or_default();
        warn!(%symbol, %reason, "Forced stop: kill latch set");

        let outcome = self.handle_stop().await;
        self.state.status = GridStatus::Killed;
        if !outcome.remaining.is_empty() {
            warn!(%symbol, remaining = ?outcome.remaining, "Orders left open after forced stop");
        }
    }

    // ========================================================================
    // Tick path
    // ========================================================================

    async fn handle_tick(&mut self, tick: PriceTick) {
        if tick.ts_ms < self.state.last_tick_ms {
            return;
        }
        self.state.current_price = Some(tick.price);
        self.state.last_tick_ms = tick.ts_ms;

        if self.state.status != GridStatus::Running {
            return;
        }

        // Autonomous stop-loss: pause and latch the sticky flag
        if let Some(stop_loss) = self.state.params.stop_loss {
            if tick.price <= stop_loss {
                let symbol = self.state.params.symbol.clone();
                warn!(%symbol, price = %tick.price, %stop_loss, "Stop-loss hit, pausing grid");
                self.state.stop_loss_tripped = true;
                let (cancelled, failed) = self.cancel_all_orders().await;
                if !failed.is_empty() {
                    warn!(%symbol, failures = failed.len(), "Stop-loss pause left orders open");
                }
                debug!(%symbol, cancelled, "Stop-loss cancellation done");
                self.state.status = GridStatus::Paused;
                return;
            }
        }

        self.check_fills().await;
        self.place_grid_orders().await;
    }

    /// Poll status for every level with an open order and apply fills.
    /// Serialized per level: one status check at a time, and its result
    /// is applied before the next one is issued.
    async fn check_fills(&mut self) {
        let epoch = self.state.epoch;

        for idx in 0..self.state.levels.len() {
            if let Some(order_id) = self.state.levels[idx].buy_order_id.clone() {
                match self.order_status_with_retry(&order_id).await {
                    Ok(status) => self.apply_buy_status(idx, epoch, &order_id, status).await,
                    Err(e) => self.note_exchange_error("order_status", &e),
                }
            }

            if idx >= self.state.levels.len() {
                break;
            }
            if let Some(order_id) = self.state.levels[idx].sell_order_id.clone() {
                match self.order_status_with_retry(&order_id).await {
                    Ok(status) => self.apply_sell_status(idx, epoch, &order_id, status).await,
                    Err(e) => self.note_exchange_error("order_status", &e),
                }
            }
        }
    }

    /// Apply a buy-order status. Discards the result when the epoch
    /// moved or the level's slot no longer holds this order.
    async fn apply_buy_status(
        &mut self,
        idx: usize,
        op_epoch: u64,
        order_id: &str,
        status: OrderStatus,
    ) {
        if self.state.epoch != op_epoch {
            debug!(order_id, op_epoch, current = self.state.epoch, "Stale epoch, discarding buy status");
            return;
        }
        let Some(level) = self.state.levels.get_mut(idx) else {
            return;
        };
        if level.buy_order_id.as_deref() != Some(order_id) {
            return;
        }

        match status.state {
            OrderState::Filled => self.complete_buy_fill(idx, order_id).await,
            OrderState::Partial => {
                level.filled_qty = status.filled_qty;
                // Consolidate once the remainder is below one lot
                let lot = self.state.params.lot_step;
                let remaining = level.remaining_qty();
                let consolidated = if lot.is_zero() {
                    remaining.is_zero()
                } else {
                    remaining <= lot
                };
                if consolidated {
                    self.complete_buy_fill(idx, order_id).await;
                }
            }
            OrderState::Cancelled => {
                // External drop: free the slot, re-placed on this or the next tick
                let symbol = &self.state.params.symbol;
                debug!(%symbol, order_id, level = level.index, "Buy cancelled externally");
                level.buy_order_id = None;
                level.filled_qty = Qty::ZERO;
                level.last_transition_ms = now_ms();
            }
            OrderState::Rejected => {
                warn!(order_id, level = level.index, "Buy rejected, level faulted");
                level.buy_order_id = None;
                level.filled_qty = Qty::ZERO;
                level.faulted = true;
                level.last_transition_ms = now_ms();
            }
            OrderState::New => {}
        }
    }

    /// Apply a sell-order status under the same guards as the buy path.
    async fn apply_sell_status(
        &mut self,
        idx: usize,
        op_epoch: u64,
        order_id: &str,
        status: OrderStatus,
    ) {
        if self.state.epoch != op_epoch {
            debug!(order_id, op_epoch, current = self.state.epoch, "Stale epoch, discarding sell status");
            return;
        }
        let Some(level) = self.state.levels.get_mut(idx) else {
            return;
        };
        if level.sell_order_id.as_deref() != Some(order_id) {
            return;
        }

        match status.state {
            OrderState::Filled => self.complete_sell_fill(idx, order_id).await,
            OrderState::Partial => {
                level.filled_qty = status.filled_qty;
                let lot = self.state.params.lot_step;
                let remaining = level.remaining_qty();
                let consolidated = if lot.is_zero() {
                    remaining.is_zero()
                } else {
                    remaining <= lot
                };
                if consolidated {
                    self.complete_sell_fill(idx, order_id).await;
                }
            }
            OrderState::Cancelled => {
                let symbol = &self.state.params.symbol;
                debug!(%symbol, order_id, level = level.index, "Sell cancelled externally");
                level.sell_order_id = None;
                level.filled_qty = Qty::ZERO;
                level.last_transition_ms = now_ms();
            }
            OrderState::Rejected => {
                warn!(order_id, level = level.index, "Sell rejected, level faulted");
                level.sell_order_id = None;
                level.filled_qty = Qty::ZERO;
                level.faulted = true;
                level.last_transition_ms = now_ms();
            }
            OrderState::New => {}
        }
    }

    /// A buy completed: the level now holds inventory; place the
    /// matching sell one spacing up (clamped to the upper bound).
    async fn complete_buy_fill(&mut self, idx: usize, order_id: &str) {
        let symbol = self.state.params.symbol.clone();
        {
            let level = &mut self.state.levels[idx];
            level.buy_order_id = None;
            level.filled_qty = Qty::ZERO;
            level.holding = true;
            level.last_transition_ms = now_ms();
            self.state.total_buys += 1;

            info!(%symbol, level = level.index, price = %level.price, "Buy filled");
            self.store.record(StoreEvent::Trade {
                ts_ms: now_ms(),
                symbol: symbol.to_string(),
                side: "buy".to_string(),
                price: level.price.to_string(),
                qty: level.qty.to_string(),
                order_id: order_id.to_string(),
                pnl: "0".to_string(),
            });
        }

        // The matching sell reserves the filled quantity; it is part of
        // the fill protocol and goes out even while the BTC filter has
        // fresh placements suspended.
        self.place_level_sell(idx).await;
    }

    /// A sell completed: one full buy→sell cycle; book the profit and
    /// re-arm the level's buy.
    async fn complete_sell_fill(&mut self, idx: usize, order_id: &str) {
        let symbol = self.state.params.symbol.clone();
        {
            let level = &mut self.state.levels[idx];
            level.sell_order_id = None;
            level.filled_qty = Qty::ZERO;
            level.holding = false;
            level.last_transition_ms = now_ms();
            self.state.total_sells += 1;

            // Profit is booked at the nominal spacing per cycle. The
            // top level's sell rests at the clamped upper bound, but
            // its cycle still earns one spacing.
            let sell_price = sell_price_for(&self.state.params, level.price);
            let gross = level.qty.inner() * self.state.params.spacing().inner();
            let fees = level.qty.inner()
                * (sell_price.inner() + level.price.inner())
                * self.state.params.fee_bps
                / Decimal::from(10_000);
            let profit = gross - fees;
            self.state.realized_pnl += profit;

            info!(%symbol, level = level.index, %profit, "Sell filled, cycle closed");
            self.store.record(StoreEvent::Trade {
                ts_ms: now_ms(),
                symbol: symbol.to_string(),
                side: "sell".to_string(),
                price: sell_price.to_string(),
                qty: level.qty.to_string(),
                order_id: order_id.to_string(),
                pnl: profit.to_string(),
            });
        }

        self.place_level_buy(idx).await;
    }

    // ========================================================================
    // Placement
    // ========================================================================

    /// Whether new grid placements are currently suspended.
    fn placements_suspended(&self) -> bool {
        if self.risk.latch().is_triggered() {
            return true;
        }
        self.state.params.btc_filter_enabled && self.risk.btc_breaker_active()
    }

    /// Place missing orders: buys for levels below the current price
    /// band, sells for holdings. Returns how many orders went out.
    ///
    /// A BTC-filter suspension only holds back fresh buys. Holding
    /// levels that lost their sell (external cancellation, earlier
    /// placement failure) get it re-placed regardless, so inventory
    /// never sits unprotected; only the kill latch stops those too.
    async fn place_grid_orders(&mut self) -> usize {
        let Some(price) = self.state.current_price else {
            return 0;
        };
        let buys_suspended = self.placements_suspended();
        if buys_suspended {
            debug!(symbol = %self.state.params.symbol, "New buy placements suspended");
        }

        let band = self.state.params.band_index(price);
        let mut placed = 0;

        for idx in 0..self.state.levels.len() {
            let (faulted, holding, has_sell, has_order, index) = {
                let level = &self.state.levels[idx];
                (
                    level.faulted,
                    level.holding,
                    level.sell_order_id.is_some(),
                    level.has_open_order(),
                    level.index,
                )
            };
            if faulted {
                continue;
            }

            if holding {
                if !has_sell && self.place_level_sell(idx).await {
                    placed += 1;
                }
            } else if !buys_suspended
                && index < band
                && !has_order
                && self.place_level_buy(idx).await
            {
                placed += 1;
            }
        }

        placed
    }

    /// Place the buy for one level. Returns true when an order went out
    /// and was recorded on the level.
    async fn place_level_buy(&mut self, idx: usize) -> bool {
        if self.placements_suspended() {
            return false;
        }
        let (symbol, price, qty, index) = {
            let level = &self.state.levels[idx];
            (
                self.state.params.symbol.clone(),
                level.price,
                level.qty,
                level.index,
            )
        };
        if !qty.is_positive() {
            return false;
        }

        let epoch = self.state.epoch;
        match self.place_with_retry(OrderSide::Buy, price, qty).await {
            Ok(placed) => {
                if self.state.epoch != epoch {
                    // Grid regenerated while the request was in flight:
                    // disown the order instead of mutating the new grid
                    debug!(order_id = %placed.order_id, "Stale epoch after placement, cancelling orphan");
                    let _ = self.exchange.cancel(&symbol, &placed.order_id).await;
                    return false;
                }
                let level = &mut self.state.levels[idx];
                level.buy_order_id = Some(placed.order_id.clone());
                level.epoch = epoch;
                level.last_transition_ms = now_ms();
                self.store.record(StoreEvent::OrderLifecycle {
                    ts_ms: now_ms(),
                    symbol: symbol.to_string(),
                    order_id: placed.order_id,
                    level: index,
                    side: "buy".to_string(),
                    state: "placed".to_string(),
                });
                true
            }
            Err(e) => {
                self.note_exchange_error("place_buy", &e);
                if !e.is_retryable() {
                    self.state.levels[idx].faulted = true;
                }
                false
            }
        }
    }

    /// Place the matching sell for a holding level. Exempt from the
    /// BTC filter (the sell protects existing inventory) but never
    /// placed under the kill latch.
    async fn place_level_sell(&mut self, idx: usize) -> bool {
        if self.risk.latch().is_triggered() {
            return false;
        }
        let (symbol, sell_price, qty, index) = {
            let level = &self.state.levels[idx];
            (
                self.state.params.symbol.clone(),
                sell_price_for(&self.state.params, level.price),
                level.qty,
                level.index,
            )
        };
        if !qty.is_positive() {
            return false;
        }

        let epoch = self.state.epoch;
        match self.place_with_retry(OrderSide::Sell, sell_price, qty).await {
            Ok(placed) => {
                if self.state.epoch != epoch {
                    debug!(order_id = %placed.order_id, "Stale epoch after placement, cancelling orphan");
                    let _ = self.exchange.cancel(&symbol, &placed.order_id).await;
                    return false;
                }
                let level = &mut self.state.levels[idx];
                level.sell_order_id = Some(placed.order_id.clone());
                level.epoch = epoch;
                level.last_transition_ms = now_ms();
                self.store.record(StoreEvent::OrderLifecycle {
                    ts_ms: now_ms(),
                    symbol: symbol.to_string(),
                    order_id: placed.order_id,
                    level: index,
                    side: "sell".to_string(),
                    state: "placed".to_string(),
                });
                true
            }
            Err(e) => {
                self.note_exchange_error("place_sell", &e);
                if !e.is_retryable() {
                    self.state.levels[idx].faulted = true;
                }
                false
            }
        }
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Adopt resting orders that match known levels; cancel strays.
    /// Defends against crash-restart leaving orphans at the exchange.
    async fn reconcile(&mut self) -> EngineResult<usize> {
        let symbol = self.state.params.symbol.clone();
        let open = match self.exchange.open_orders(&symbol).await {
            Ok(open) => open,
            Err(e) => {
                self.note_exchange_error("open_orders", &e);
                return Err(EngineError::ExchangeUnavailable(e.to_string()));
            }
        };
        if open.is_empty() {
            return Ok(0);
        }

        let spacing = self.state.params.spacing();
        let half_spacing = Price::new(spacing.inner() / Decimal::TWO);
        let mut adopted = 0;

        for order in open {
            if self.try_adopt(&order, half_spacing) {
                adopted += 1;
                continue;
            }
            info!(%symbol, order_id = %order.order_id, price = %order.price, "Cancelling unrecognized order");
            if let Err(e) = self.cancel_with_retry(&order.order_id).await {
                self.note_exchange_error("cancel_stray", &e);
            }
        }

        if adopted > 0 {
            info!(%symbol, adopted, "Reconciled resting orders into grid");
        }
        Ok(adopted)
    }

    /// Match one resting order against the grid within half a spacing.
    fn try_adopt(&mut self, order: &OpenOrder, half_spacing: Price) -> bool {
        let params = self.state.params.clone();
        let epoch = self.state.epoch;

        for level in &mut self.state.levels {
            match order.side {
                OrderSide::Buy => {
                    if level.buy_order_id.is_none()
                        && !level.holding
                        && order.price.abs_diff(level.price) <= half_spacing
                    {
                        level.buy_order_id = Some(order.order_id.clone());
                        level.epoch = epoch;
                        level.last_transition_ms = now_ms();
                        return true;
                    }
                }
                OrderSide::Sell => {
                    let target = sell_price_for(&params, level.price);
                    if level.sell_order_id.is_none()
                        && level.buy_order_id.is_none()
                        && order.price.abs_diff(target) <= half_spacing
                    {
                        // An adopted sell implies inventory from before
                        // the restart
                        level.sell_order_id = Some(order.order_id.clone());
                        level.holding = true;
                        level.epoch = epoch;
                        level.last_transition_ms = now_ms();
                        return true;
                    }
                }
            }
        }
        false
    }

    // ========================================================================
    // Exchange helpers
    // ========================================================================

    /// Cancel every order recorded on the levels. Returns the count
    /// cancelled and the ids that survived all retries.
    async fn cancel_all_orders(&mut self) -> (usize, Vec<String>) {
        let ids: Vec<(usize, String)> = self
            .state
            .levels
            .iter()
            .enumerate()
            .flat_map(|(idx, level)| {
                level
                    .buy_order_id
                    .iter()
                    .chain(level.sell_order_id.iter())
                    .map(move |id| (idx, id.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut cancelled = 0;
        let mut failed = Vec::new();
        for (idx, order_id) in ids {
            match self.cancel_with_retry(&order_id).await {
                Ok(()) => {
                    cancelled += 1;
                    if let Some(level) = self.state.levels.get_mut(idx) {
                        if level.buy_order_id.as_deref() == Some(order_id.as_str()) {
                            level.buy_order_id = None;
                        }
                        if level.sell_order_id.as_deref() == Some(order_id.as_str()) {
                            level.sell_order_id = None;
                        }
                        level.filled_qty = Qty::ZERO;
                        level.last_transition_ms = now_ms();
                    }
                }
                Err(e) => {
                    self.note_exchange_error("cancel", &e);
                    failed.push(order_id);
                }
            }
        }
        (cancelled, failed)
    }

    async fn place_with_retry(
        &self,
        side: OrderSide,
        price: Price,
        qty: Qty,
    ) -> ExchangeResult<PlacedOrder> {
        let symbol = &self.state.params.symbol;
        let tag = ClientOrderId::new();
        let mut delay = RETRY_BASE_DELAY;

        for attempt in 0..RETRY_ATTEMPTS {
            match self
                .exchange
                .place_limit(symbol, side, price, qty, &tag)
                .await
            {
                Ok(placed) => return Ok(placed),
                Err(e) if e.is_retryable() && attempt + 1 < RETRY_ATTEMPTS => {
                    debug!(%symbol, %side, attempt, error = %e, "Placement retry");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("loop always returns")
    }

    async fn cancel_with_retry(&self, order_id: &str) -> ExchangeResult<()> {
        let symbol = &self.state.params.symbol;
        let mut delay = RETRY_BASE_DELAY;

        for attempt in 0..RETRY_ATTEMPTS {
            match self.exchange.cancel(symbol, order_id).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt + 1 < RETRY_ATTEMPTS => {
                    debug!(%symbol, order_id, attempt, error = %e, "Cancel retry");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("loop always returns")
    }

    async fn order_status_with_retry(&self, order_id: &str) -> ExchangeResult<OrderStatus> {
        let symbol = &self.state.params.symbol;
        let mut delay = RETRY_BASE_DELAY;

        for attempt in 0..RETRY_ATTEMPTS {
            match self.exchange.order_status(symbol, order_id).await {
                Ok(status) => return Ok(status),
                Err(e) if e.is_retryable() && attempt + 1 < RETRY_ATTEMPTS => {
                    debug!(%symbol, order_id, attempt, error = %e, "Status retry");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("loop always returns")
    }

    /// Log and escalate a failed exchange call. Auth failures trip the
    /// kill latch immediately; everything else is already counted by
    /// the metered wrapper and retried by the callers.
    fn note_exchange_error(&self, op: &str, error: &ExchangeError) {
        let symbol = &self.state.params.symbol;
        if error.is_auth() {
            warn!(%symbol, op, %error, "Authentication failure, escalating");
            self.risk
                .trigger_kill(format!("Exchange authentication failure during {op}"));
        } else {
            debug!(%symbol, op, %error, "Exchange call failed");
        }
    }
}

/// Sell price for a level: one spacing above, clamped to the band top,
/// rounded to the tick.
fn sell_price_for(params: &GridParameters, level_price: Price) -> Price {
    let raw = level_price + params.spacing();
    let clamped = if raw > params.upper_price {
        params.upper_price
    } else {
        raw
    };
    clamped.round_to_tick(params.tick_size)
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::default_deployments;
    use gridbot_exchange::MockExchange;
    use gridbot_persistence::NullStore;
    use gridbot_risk::{RiskConfig, RiskSupervisor};
    use rust_decimal_macros::dec;

    fn btc_params() -> GridParameters {
        default_deployments().remove(0)
    }

    /// Worker with the price pre-seeded so `start` skips the ticker
    /// call and tests can use small artificial tick timestamps.
    fn test_worker(mock: Arc<MockExchange>) -> GridWorker {
        let mut state = GridState::new(btc_params());
        state.current_price = Some(Price::new(dec!(97250)));
        GridWorker {
            state,
            exchange: mock,
            risk: Arc::new(RiskSupervisor::new(RiskConfig::default())),
            store: Arc::new(NullStore),
        }
    }

    #[tokio::test]
    async fn test_cold_start_places_buys_below_price() {
        let mock = Arc::new(MockExchange::new());
        mock.seed_price(&Symbol::new("BTCUSDT"), Price::new(dec!(97250)));
        let mut worker = test_worker(mock.clone());

        let outcome = worker.handle_start(true).await.unwrap();

        // band_index(97250) = 6, levels 0..=5 get buys, no sells cold
        assert_eq!(outcome.orders_placed, 6);
        assert_eq!(outcome.adopted, 0);
        assert_eq!(worker.state.status, GridStatus::Running);
        assert_eq!(mock.open_order_count(&Symbol::new("BTCUSDT")), 6);
        assert!(worker
            .state
            .levels
            .iter()
            .all(|l| l.sell_order_id.is_none()));
    }

    #[tokio::test]
    async fn test_single_side_per_level_invariant() {
        let mock = Arc::new(MockExchange::new());
        mock.seed_price(&Symbol::new("BTCUSDT"), Price::new(dec!(97250)));
        let mut worker = test_worker(mock.clone());
        worker.handle_start(true).await.unwrap();

        // Walk the price through fills and re-placements
        for price in [dec!(96100), dec!(95700), dec!(96200), dec!(97000), dec!(97700)] {
            mock.set_price(&Symbol::new("BTCUSDT"), Price::new(price));
            worker
                .handle_tick(PriceTick::new(
                    Symbol::new("BTCUSDT"),
                    Price::new(price),
                    worker.state.last_tick_ms + 1000,
                ))
                .await;

            for level in &worker.state.levels {
                assert!(
                    !(level.buy_order_id.is_some() && level.sell_order_id.is_some()),
                    "level {} holds both sides",
                    level.index
                );
            }
        }
    }

    #[tokio::test]
    async fn test_buy_fill_sets_holding_and_places_sell() {
        let mock = Arc::new(MockExchange::new());
        let btc = Symbol::new("BTCUSDT");
        mock.seed_price(&btc, Price::new(dec!(97250)));
        let mut worker = test_worker(mock.clone());
        worker.handle_start(true).await.unwrap();

        // Drop through the top buy level (level 5 at ~97104.17)
        mock.set_price(&btc, Price::new(dec!(97100)));
        worker
            .handle_tick(PriceTick::new(btc.clone(), Price::new(dec!(97100)), 1))
            .await;

        let level5 = &worker.state.levels[5];
        assert!(level5.holding);
        assert!(level5.buy_order_id.is_none());
        assert!(level5.sell_order_id.is_some());
        assert_eq!(worker.state.total_buys, 1);
    }

    #[tokio::test]
    async fn test_sell_fill_books_profit_and_rearms_buy() {
        let mock = Arc::new(MockExchange::new());
        let btc = Symbol::new("BTCUSDT");
        mock.seed_price(&btc, Price::new(dec!(97250)));
        let mut worker = test_worker(mock.clone());
        worker.handle_start(true).await.unwrap();

        mock.set_price(&btc, Price::new(dec!(97100)));
        worker
            .handle_tick(PriceTick::new(btc.clone(), Price::new(dec!(97100)), 1))
            .await;
        assert_eq!(worker.state.total_buys, 1);

        // Rise through the sell at level5.price + spacing ≈ 97395.83
        mock.set_price(&btc, Price::new(dec!(97700)));
        worker
            .handle_tick(PriceTick::new(btc.clone(), Price::new(dec!(97700)), 2))
            .await;

        assert_eq!(worker.state.total_sells, 1);
        let level5 = &worker.state.levels[5];
        assert!(!level5.holding);
        assert!(level5.sell_order_id.is_none());
        // Buy re-armed at the original level price
        assert!(level5.buy_order_id.is_some());

        // profit = qty * spacing, no fees configured
        let expected = worker.state.levels[5].qty.inner() * worker.state.params.spacing().inner();
        assert!((worker.state.realized_pnl - expected).abs() < dec!(0.0001));
    }

    #[tokio::test]
    async fn test_pnl_non_decreasing_through_cycles() {
        let mock = Arc::new(MockExchange::new());
        let btc = Symbol::new("BTCUSDT");
        mock.seed_price(&btc, Price::new(dec!(97250)));
        let mut worker = test_worker(mock.clone());
        worker.handle_start(true).await.unwrap();

        let mut last_pnl = Decimal::ZERO;
        let mut ts = 0i64;
        for price in [
            dec!(96100),
            dec!(97700),
            dec!(96100),
            dec!(97700),
            dec!(95700),
            dec!(97700),
        ] {
            ts += 1000;
            mock.set_price(&btc, Price::new(price));
            worker
                .handle_tick(PriceTick::new(btc.clone(), Price::new(price), ts))
                .await;
            assert!(worker.state.realized_pnl >= last_pnl);
            last_pnl = worker.state.realized_pnl;
        }
        assert!(last_pnl > Decimal::ZERO);
        assert_eq!(worker.state.total_buys, worker.state.total_sells + worker.state.levels.iter().filter(|l| l.holding).count() as u64);
    }

    #[tokio::test]
    async fn test_stop_cancels_everything_and_clears_levels() {
        let mock = Arc::new(MockExchange::new());
        let btc = Symbol::new("BTCUSDT");
        mock.seed_price(&btc, Price::new(dec!(97250)));
        let mut worker = test_worker(mock.clone());
        worker.handle_start(true).await.unwrap();
        assert_eq!(mock.open_order_count(&btc), 6);

        let outcome = worker.handle_stop().await;

        assert_eq!(outcome.cancelled, 6);
        assert!(outcome.remaining.is_empty());
        assert_eq!(mock.open_order_count(&btc), 0);
        assert!(worker.state.levels.is_empty());
        assert_eq!(worker.state.status, GridStatus::Stopped);
        assert_eq!(worker.state.epoch, 1);
    }

    #[tokio::test]
    async fn test_stop_loss_tick_pauses_and_sticks() {
        let mock = Arc::new(MockExchange::new());
        let btc = Symbol::new("BTCUSDT");
        mock.seed_price(&btc, Price::new(dec!(97250)));
        let mut worker = test_worker(mock.clone());
        worker.handle_start(true).await.unwrap();

        // 94750 < stop_loss 94800
        worker
            .handle_tick(PriceTick::new(btc.clone(), Price::new(dec!(94750)), 1))
            .await;

        assert_eq!(worker.state.status, GridStatus::Paused);
        assert!(worker.state.stop_loss_tripped);

        // Start without acknowledgement fails with the sticky error
        let err = worker.handle_start(true).await.unwrap_err();
        assert!(matches!(err, EngineError::StopLossTripped(_)));
        assert_eq!(err.to_string(), "Stop-loss tripped for BTCUSDT");

        // Explicit stop acknowledges; price must also recover
        worker.handle_stop().await;
        assert!(!worker.state.stop_loss_tripped);
        worker.state.current_price = Some(Price::new(dec!(97250)));
        worker.handle_start(true).await.unwrap();
        assert_eq!(worker.state.status, GridStatus::Running);
    }

    #[tokio::test]
    async fn test_epoch_isolation_discards_stale_fill() {
        let mock = Arc::new(MockExchange::new());
        let btc = Symbol::new("BTCUSDT");
        mock.seed_price(&btc, Price::new(dec!(97250)));
        let mut worker = test_worker(mock.clone());
        worker.handle_start(true).await.unwrap();

        let old_epoch = worker.state.epoch;
        let old_order = worker.state.levels[5].buy_order_id.clone().unwrap();

        // Rebalance regenerates the grid under a new epoch
        worker.handle_rebalance().await.unwrap();
        assert_eq!(worker.state.epoch, old_epoch + 1);

        // A FILLED callback from the old epoch must change nothing
        let stale = OrderStatus::new(
            OrderState::Filled,
            worker.state.levels[5].qty,
            worker.state.levels[5].price,
        );
        worker.apply_buy_status(5, old_epoch, &old_order, stale).await;

        assert_eq!(worker.state.total_buys, 0);
        assert!(!worker.state.levels[5].holding);
        assert!(worker.state.levels[5].sell_order_id.is_none());
    }

    #[tokio::test]
    async fn test_rebalance_cancels_old_epoch_orders() {
        let mock = Arc::new(MockExchange::new());
        let btc = Symbol::new("BTCUSDT");
        mock.seed_price(&btc, Price::new(dec!(97250)));
        let mut worker = test_worker(mock.clone());
        worker.handle_start(true).await.unwrap();

        let old_ids: Vec<String> = worker
            .state
            .levels
            .iter()
            .filter_map(|l| l.buy_order_id.clone())
            .collect();
        assert_eq!(old_ids.len(), 6);

        let outcome = worker.handle_rebalance().await.unwrap();
        assert_eq!(outcome.stopped.cancelled, 6);
        assert_eq!(outcome.started.orders_placed, 6);

        // No old id survives on the new grid
        for level in &worker.state.levels {
            if let Some(id) = &level.buy_order_id {
                assert!(!old_ids.contains(id));
            }
        }
    }

    #[tokio::test]
    async fn test_reconcile_adopts_and_cancels_stray() {
        let mock = Arc::new(MockExchange::new());
        let btc = Symbol::new("BTCUSDT");
        mock.seed_price(&btc, Price::new(dec!(97250)));

        let params = btc_params();
        // Four resting buys at recognizable grid prices
        for i in 0..4 {
            mock.seed_open_order(
                &btc,
                OrderSide::Buy,
                params.level_price(i),
                params.level_qty(i),
            );
        }
        // One stray far off-grid
        let stray = mock.seed_open_order(
            &btc,
            OrderSide::Buy,
            Price::new(dec!(90000)),
            Qty::new(dec!(0.01)),
        );

        let mut worker = test_worker(mock.clone());
        let outcome = worker.handle_start(true).await.unwrap();

        assert_eq!(outcome.adopted, 4);
        // Levels 0..=3 adopted, levels 4 and 5 freshly placed
        assert_eq!(outcome.orders_placed, 2);
        assert_eq!(mock.order_state(&stray), Some(OrderState::Cancelled));
        assert_eq!(mock.open_order_count(&btc), 6);
    }

    #[tokio::test]
    async fn test_partial_fill_consolidation() {
        let mock = Arc::new(MockExchange::new());
        let btc = Symbol::new("BTCUSDT");
        mock.seed_price(&btc, Price::new(dec!(97250)));

        let mut params = btc_params();
        params.lot_step = Qty::new(dec!(0.0001));
        let mut worker = test_worker(mock.clone());
        worker.state = GridState::new(params);
        worker.state.current_price = Some(Price::new(dec!(97250)));
        worker.handle_start(true).await.unwrap();

        let order_id = worker.state.levels[5].buy_order_id.clone().unwrap();
        let qty = worker.state.levels[5].qty;
        let epoch = worker.state.epoch;

        // Fill half: stays open, no holding yet
        let half = Qty::new(qty.inner() / Decimal::TWO);
        worker
            .apply_buy_status(
                5,
                epoch,
                &order_id,
                OrderStatus::new(OrderState::Partial, half, worker.state.levels[5].price),
            )
            .await;
        assert!(!worker.state.levels[5].holding);
        assert_eq!(worker.state.levels[5].filled_qty, half);

        // Fill to within one lot of the target: consolidates
        let nearly = qty.saturating_sub(Qty::new(dec!(0.00005)));
        worker
            .apply_buy_status(
                5,
                epoch,
                &order_id,
                OrderStatus::new(OrderState::Partial, nearly, worker.state.levels[5].price),
            )
            .await;
        assert!(worker.state.levels[5].holding);
        assert_eq!(worker.state.total_buys, 1);
        assert!(worker.state.levels[5].sell_order_id.is_some());
    }

    #[tokio::test]
    async fn test_external_cancel_replaced_on_next_tick() {
        let mock = Arc::new(MockExchange::new());
        let btc = Symbol::new("BTCUSDT");
        mock.seed_price(&btc, Price::new(dec!(97250)));
        let mut worker = test_worker(mock.clone());
        worker.handle_start(true).await.unwrap();

        let order_id = worker.state.levels[0].buy_order_id.clone().unwrap();
        mock.cancel_externally(&order_id);

        worker
            .handle_tick(PriceTick::new(btc.clone(), Price::new(dec!(97250)), 1))
            .await;

        let new_id = worker.state.levels[0].buy_order_id.clone().unwrap();
        assert_ne!(new_id, order_id);
        assert_eq!(mock.open_order_count(&btc), 6);
    }

    #[tokio::test]
    async fn test_placement_failure_marks_level_for_retry() {
        let mock = Arc::new(MockExchange::new());
        let btc = Symbol::new("BTCUSDT");
        mock.seed_price(&btc, Price::new(dec!(97250)));
        let mut worker = test_worker(mock.clone());

        // First placement fails through all retries
        for _ in 0..RETRY_ATTEMPTS {
            mock.fail_next_op("place_limit", ExchangeError::Transient("down".into()));
        }
        let outcome = worker.handle_start(true).await.unwrap();
        assert_eq!(outcome.orders_placed, 5);

        // The missed level is not faulted and fills in on the next tick
        assert!(worker.state.levels.iter().all(|l| !l.faulted));
        worker
            .handle_tick(PriceTick::new(btc.clone(), Price::new(dec!(97250)), 1))
            .await;
        assert_eq!(mock.open_order_count(&btc), 6);
    }

    #[tokio::test]
    async fn test_invalid_placement_faults_level() {
        let mock = Arc::new(MockExchange::new());
        let btc = Symbol::new("BTCUSDT");
        mock.seed_price(&btc, Price::new(dec!(97250)));
        let mut worker = test_worker(mock.clone());

        mock.fail_next_op("place_limit", ExchangeError::Invalid("insufficient balance".into()));
        let outcome = worker.handle_start(true).await.unwrap();

        assert_eq!(outcome.orders_placed, 5);
        assert_eq!(worker.state.levels.iter().filter(|l| l.faulted).count(), 1);

        // Faulted level is skipped on later ticks
        worker
            .handle_tick(PriceTick::new(btc.clone(), Price::new(dec!(97250)), 1))
            .await;
        assert_eq!(mock.open_order_count(&btc), 5);
    }

    #[tokio::test]
    async fn test_auth_error_trips_latch() {
        let mock = Arc::new(MockExchange::new());
        let btc = Symbol::new("BTCUSDT");
        mock.seed_price(&btc, Price::new(dec!(97250)));
        let mut worker = test_worker(mock.clone());

        mock.fail_next_op("place_limit", ExchangeError::Auth("bad signature".into()));
        let _ = worker.handle_start(true).await;

        assert!(worker.risk.latch().is_triggered());
        assert!(worker
            .risk
            .latch()
            .reason()
            .unwrap()
            .contains("authentication"));
    }

    #[tokio::test]
    async fn test_start_blocked_while_killed() {
        let mock = Arc::new(MockExchange::new());
        mock.seed_price(&Symbol::new("BTCUSDT"), Price::new(dec!(97250)));
        let mut worker = test_worker(mock.clone());
        worker.risk.trigger_kill("Manual kill switch activated");

        let err = worker.handle_start(true).await.unwrap_err();
        assert!(matches!(err, EngineError::KilledByRisk(_)));
    }

    #[tokio::test]
    async fn test_pause_keeps_holdings_resume_replaces_sells() {
        let mock = Arc::new(MockExchange::new());
        let btc = Symbol::new("BTCUSDT");
        mock.seed_price(&btc, Price::new(dec!(97250)));
        let mut worker = test_worker(mock.clone());
        worker.handle_start(true).await.unwrap();

        // Fill level 5's buy, leaving a holding with a resting sell
        mock.set_price(&btc, Price::new(dec!(97100)));
        worker
            .handle_tick(PriceTick::new(btc.clone(), Price::new(dec!(97100)), 1))
            .await;
        assert!(worker.state.levels[5].holding);

        let outcome = worker.handle_pause().await.unwrap();
        assert!(outcome.cancelled >= 1);
        assert_eq!(worker.state.status, GridStatus::Paused);
        assert_eq!(mock.open_order_count(&btc), 0);
        assert!(worker.state.levels[5].holding);

        // Resume keeps the holding and re-places its sell
        let resumed = worker.handle_start(false).await.unwrap();
        assert!(resumed.orders_placed >= 1);
        assert!(worker.state.levels[5].holding);
        assert!(worker.state.levels[5].sell_order_id.is_some());
    }

    #[tokio::test]
    async fn test_top_level_cycle_books_nominal_spacing() {
        let mock = Arc::new(MockExchange::new());
        let symbol = Symbol::new("BTCUSDT");
        // Tight 3-level grid: spacing 10, levels at 105/115/125. The
        // top level's sell clamps from 135 to the 130 upper bound.
        let params = GridParameters {
            symbol: symbol.clone(),
            lower_price: Price::new(dec!(100)),
            upper_price: Price::new(dec!(130)),
            grid_count: 3,
            total_investment: dec!(300),
            stop_loss: None,
            take_profit: None,
            btc_filter_enabled: false,
            fee_bps: Decimal::ZERO,
            tick_size: Price::ZERO,
            lot_step: Qty::ZERO,
        };

        // The normal band placement never arms the top level's buy, so
        // seed it at the exchange and let reconciliation adopt it
        mock.seed_open_order(
            &symbol,
            OrderSide::Buy,
            params.level_price(2),
            params.level_qty(2),
        );

        let mut worker = test_worker(mock.clone());
        worker.state = GridState::new(params.clone());
        worker.state.current_price = Some(Price::new(dec!(128)));

        let outcome = worker.handle_start(true).await.unwrap();
        assert_eq!(outcome.adopted, 1);
        assert_eq!(outcome.orders_placed, 2);

        // Drop through every buy, then rise through every sell
        // (including the clamped one at 130)
        mock.set_price(&symbol, Price::new(dec!(104)));
        worker
            .handle_tick(PriceTick::new(symbol.clone(), Price::new(dec!(104)), 1))
            .await;
        assert_eq!(worker.state.total_buys, 3);

        mock.set_price(&symbol, Price::new(dec!(130)));
        worker
            .handle_tick(PriceTick::new(symbol.clone(), Price::new(dec!(130)), 2))
            .await;
        assert_eq!(worker.state.total_sells, 3);

        // Every cycle earns one nominal spacing, the clamped top level
        // included
        let spacing = params.spacing().inner();
        let expected: Decimal = (0..3).map(|i| params.level_qty(i).inner() * spacing).sum();
        assert!(
            (worker.state.realized_pnl - expected).abs() < dec!(0.0001),
            "pnl = {}, expected = {}",
            worker.state.realized_pnl,
            expected
        );
    }

    #[tokio::test]
    async fn test_btc_filter_holds_buys_but_replaces_protective_sell() {
        let mock = Arc::new(MockExchange::new());
        let btc = Symbol::new("BTCUSDT");
        mock.seed_price(&btc, Price::new(dec!(97250)));
        let mut worker = test_worker(mock.clone());
        worker.state.params.btc_filter_enabled = true;
        worker.handle_start(true).await.unwrap();

        // Fill level 5's buy so it holds inventory with a resting sell
        mock.set_price(&btc, Price::new(dec!(97100)));
        worker
            .handle_tick(PriceTick::new(btc.clone(), Price::new(dec!(97100)), 1))
            .await;
        assert!(worker.state.levels[5].holding);
        let sell_id = worker.state.levels[5].sell_order_id.clone().unwrap();
        let buy0_id = worker.state.levels[0].buy_order_id.clone().unwrap();

        // The exchange drops both orders; meanwhile the BTC breaker
        // goes active
        mock.cancel_externally(&sell_id);
        mock.cancel_externally(&buy0_id);
        for i in 0i64..10 {
            let factor = if i % 2 == 0 { dec!(1.08) } else { dec!(0.92) };
            worker.risk.record_tick(&PriceTick::new(
                btc.clone(),
                Price::new(dec!(97250) * factor),
                i * 1000,
            ));
        }
        assert!(worker.risk.btc_breaker_active());
        assert!(!worker.risk.latch().is_triggered());

        worker
            .handle_tick(PriceTick::new(btc.clone(), Price::new(dec!(97250)), 2))
            .await;

        // The fresh buy stays suspended under the filter, but the
        // holding's protective sell is back on the book
        assert!(worker.state.levels[0].buy_order_id.is_none());
        assert!(worker.state.levels[5].holding);
        assert!(worker.state.levels[5].sell_order_id.is_some());
        assert_ne!(
            worker.state.levels[5].sell_order_id.as_deref(),
            Some(sell_id.as_str())
        );
    }
}

//! Controller: owns the worker set and the risk handles.
//!
//! Control operations are serialized per worker by the worker mailbox;
//! the controller itself only routes. Kill is the exception: it trips
//! the shared latch first (which preempts every worker through its
//! watch channel) and only then collects per-worker cancellation
//! results.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use gridbot_core::Symbol;
use gridbot_exchange::DynExchange;
use gridbot_feed::FeedHandle;
use gridbot_persistence::{DynStore, StoreEvent};
use gridbot_risk::{RiskError, RiskSnapshot, RiskSupervisor};

use crate::error::{EngineError, EngineResult};
use crate::params::GridParameters;
use crate::state::GridSnapshot;
use crate::worker::{
    spawn_worker, PauseOutcome, RebalanceOutcome, StartOutcome, StopOutcome, WorkerHandle,
};

/// Atomic view of every grid plus the risk state.
#[derive(Debug, Clone, Serialize)]
pub struct SystemSnapshot {
    pub grids: HashMap<String, GridSnapshot>,
    pub risk: RiskSnapshot,
}

/// Supervisor of all grid workers.
pub struct Controller {
    exchange: DynExchange,
    risk: Arc<RiskSupervisor>,
    store: DynStore,
    feed: FeedHandle,
    workers: RwLock<HashMap<Symbol, WorkerHandle>>,
}

impl Controller {
    pub fn new(
        exchange: DynExchange,
        risk: Arc<RiskSupervisor>,
        store: DynStore,
        feed: FeedHandle,
    ) -> Self {
        Self {
            exchange,
            risk,
            store,
            feed,
            workers: RwLock::new(HashMap::new()),
        }
    }

    pub fn risk(&self) -> &Arc<RiskSupervisor> {
        &self.risk
    }

    /// Symbols with a deployed worker.
    pub fn symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self.workers.read().keys().cloned().collect();
        symbols.sort();
        symbols
    }

    fn worker(&self, symbol: &Symbol) -> EngineResult<WorkerHandle> {
        self.workers
            .read()
            .get(symbol)
            .cloned()
            .ok_or_else(|| EngineError::UnknownSymbol(symbol.clone()))
    }

    // ========================================================================
    // Deployment
    // ========================================================================

    /// Install (or replace) a grid deployment. The new worker starts in
    /// STOPPED; an explicit `start` arms it.
    pub async fn deploy(&self, params: GridParameters) -> EngineResult<()> {
        params.validate()?;
        let symbol = params.symbol.clone();

        // Replace: stop and drop any previous worker for the symbol
        if let Ok(previous) = self.worker(&symbol) {
            info!(%symbol, "Replacing deployed grid");
            if let Err(e) = previous.stop().await {
                warn!(%symbol, error = %e, "Stop of replaced worker failed");
            }
            self.workers.write().remove(&symbol);
        }

        self.store.record(StoreEvent::GridConfig {
            ts_ms: chrono::Utc::now().timestamp_millis(),
            symbol: symbol.to_string(),
            lower_price: params.lower_price.to_string(),
            upper_price: params.upper_price.to_string(),
            grid_count: params.grid_count,
            total_investment: params.total_investment.to_string(),
        });

        self.feed.add_symbol(symbol.clone());
        let tick_rx = self.feed.subscribe(&symbol);
        let handle = spawn_worker(
            params,
            self.exchange.clone(),
            self.risk.clone(),
            self.store.clone(),
            tick_rx,
        );
        self.workers.write().insert(symbol.clone(), handle);

        info!(%symbol, "Grid deployed");
        Ok(())
    }

    /// Remove a deployment entirely, stopping it first.
    pub async fn undeploy(&self, symbol: &Symbol) -> EngineResult<StopOutcome> {
        let handle = self.worker(symbol)?;
        let outcome = handle.stop().await?;
        self.workers.write().remove(symbol);
        info!(%symbol, "Grid undeployed");
        Ok(outcome)
    }

    // ========================================================================
    // Per-symbol operations
    // ========================================================================

    pub async fn start(&self, symbol: &Symbol) -> EngineResult<StartOutcome> {
        self.worker(symbol)?.start().await
    }

    pub async fn pause(&self, symbol: &Symbol) -> EngineResult<PauseOutcome> {
        self.worker(symbol)?.pause().await
    }

    pub async fn resume(&self, symbol: &Symbol) -> EngineResult<StartOutcome> {
        self.worker(symbol)?.resume().await
    }

    pub async fn stop(&self, symbol: &Symbol) -> EngineResult<StopOutcome> {
        self.worker(symbol)?.stop().await
    }

    pub async fn rebalance(&self, symbol: &Symbol) -> EngineResult<RebalanceOutcome> {
        self.worker(symbol)?.rebalance().await
    }

    pub async fn grid_snapshot(&self, symbol: &Symbol) -> EngineResult<GridSnapshot> {
        self.worker(symbol)?.snapshot().await
    }

    // ========================================================================
    // Fanout operations
    // ========================================================================

    pub async fn start_all(&self) -> Vec<(Symbol, EngineResult<StartOutcome>)> {
        let mut results = Vec::new();
        for symbol in self.symbols() {
            let result = self.start(&symbol).await;
            results.push((symbol, result));
        }
        results
    }

    pub async fn pause_all(&self) -> Vec<(Symbol, EngineResult<PauseOutcome>)> {
        let mut results = Vec::new();
        for symbol in self.symbols() {
            let result = self.pause(&symbol).await;
            results.push((symbol, result));
        }
        results
    }

    pub async fn resume_all(&self) -> Vec<(Symbol, EngineResult<StartOutcome>)> {
        let mut results = Vec::new();
        for symbol in self.symbols() {
            let result = self.resume(&symbol).await;
            results.push((symbol, result));
        }
        results
    }

    pub async fn rebalance_all(&self) -> Vec<(Symbol, EngineResult<RebalanceOutcome>)> {
        let mut results = Vec::new();
        for symbol in self.symbols() {
            let result = self.rebalance(&symbol).await;
            results.push((symbol, result));
        }
        results
    }

    // ========================================================================
    // Kill switch
    // ========================================================================

    /// Trip the kill latch and force every worker down, aggregating
    /// per-symbol cancellation results. The latch is set before any
    /// worker is contacted, so delivery preempts queued commands.
    pub async fn kill(&self, reason: impl Into<String>) -> Vec<(Symbol, EngineResult<StopOutcome>)> {
        let reason = reason.into();
        self.risk.trigger_kill(reason.clone());
        self.store.record(StoreEvent::Kill {
            ts_ms: chrono::Utc::now().timestamp_millis(),
            triggered: true,
            reason: Some(reason),
        });

        let mut results = Vec::new();
        for symbol in self.symbols() {
            let result = match self.worker(&symbol) {
                Ok(handle) => handle.stop().await,
                Err(e) => Err(e),
            };
            results.push((symbol, result));
        }
        results
    }

    /// Clear the latch; refused while a kill condition still holds.
    pub fn reset_kill(&self) -> Result<(), RiskError> {
        self.risk.reset_kill()?;
        self.store.record(StoreEvent::Kill {
            ts_ms: chrono::Utc::now().timestamp_millis(),
            triggered: false,
            reason: None,
        });
        Ok(())
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Atomic read of all grid states plus the risk state.
    pub async fn snapshot(&self) -> SystemSnapshot {
        let mut grids = HashMap::new();
        for symbol in self.symbols() {
            if let Ok(snap) = self.grid_snapshot(&symbol).await {
                grids.insert(symbol.to_string(), snap);
            }
        }
        SystemSnapshot {
            grids,
            risk: self.risk.snapshot(),
        }
    }
}

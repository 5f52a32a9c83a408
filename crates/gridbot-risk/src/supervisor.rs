//! Risk supervisor: volatility breakers, API error budget, equity
//! drawdown, pre-trade gate, kill-condition evaluation.
//!
//! Counters are updated from many tasks (the metered exchange wrapper,
//! the feed fanout, the equity poller) and each update holds a lock for
//! O(1) or O(window) work only. The kill latch itself is shared with
//! the controller and all workers.
//!
//! The API error-rate estimator uses a rolling 5-minute wall-clock
//! window; the kill condition additionally requires at least
//! `api_warmup_calls` calls in the window so a failure burst right
//! after startup cannot kill the process on a tiny sample.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use gridbot_core::{Price, PriceTick, Symbol};
use gridbot_exchange::{CallObserver, DynExchange};

use crate::error::{RiskError, RiskResult};
use crate::latch::KillLatch;
use crate::window::PriceWindow;

/// Symbol whose volatility drives the BTC filter.
pub const BTC_SYMBOL: &str = "BTCUSDT";

/// Rolling horizon of the API error-rate estimator.
const ERROR_WINDOW: Duration = Duration::from_secs(300);

// ============================================================================
// Config
// ============================================================================

/// Risk thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Kill when drawdown reaches `-max_drawdown_pct`.
    pub max_drawdown_pct: Decimal,
    /// Kill when the in-window API error rate reaches this, in percent.
    pub max_api_error_rate_pct: Decimal,
    /// Minimum in-window calls before the error-rate condition can fire.
    pub api_warmup_calls: u64,
    /// A symbol's breaker is active above this volatility, in percent.
    pub volatility_threshold_pct: Decimal,
    /// Kill when at least this many breakers are active at once.
    pub volatility_breaker_count: usize,
    /// Pre-trade gate: max single-symbol investment as percent of equity.
    pub max_position_pct: Decimal,
    /// Price window capacity per symbol.
    pub window_capacity: usize,
    /// Newest samples entering the volatility estimate.
    pub volatility_samples: usize,
    /// Wallet equity poll cadence in seconds.
    pub equity_poll_secs: u64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_drawdown_pct: Decimal::from(30),
            max_api_error_rate_pct: Decimal::from(2),
            api_warmup_calls: 50,
            volatility_threshold_pct: Decimal::from(5),
            volatility_breaker_count: 2,
            max_position_pct: Decimal::from(50),
            window_capacity: 100,
            volatility_samples: 10,
            equity_poll_secs: 60,
        }
    }
}

// ============================================================================
// Pre-trade gate
// ============================================================================

/// What a worker submits to the pre-trade gate before going RUNNING.
#[derive(Debug, Clone)]
pub struct StartCheck {
    pub symbol: Symbol,
    pub current_price: Option<Price>,
    pub stop_loss: Option<Price>,
    pub btc_filter_enabled: bool,
    /// Total investment the grid would commit, in quote currency.
    pub investment: Decimal,
}

/// Gate verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allowed,
    Blocked(String),
}

impl GateDecision {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    #[must_use]
    pub fn blocked_reason(&self) -> Option<&str> {
        match self {
            Self::Allowed => None,
            Self::Blocked(reason) => Some(reason),
        }
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Read-only risk state for the HTTP surface. Floats are fine here;
/// nothing downstream trades on them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub total_equity: f64,
    pub initial_equity: f64,
    pub drawdown_percent: f64,
    pub api_error_rate: f64,
    pub volatility_breakers: usize,
    pub kill_switch_triggered: bool,
    pub kill_switch_reason: Option<String>,
    /// Condition that would kill right now, latched or not.
    pub potential_kill_reason: Option<String>,
    pub last_check: String,
}

// ============================================================================
// Supervisor
// ============================================================================

#[derive(Debug, Default)]
struct EquityState {
    /// Baseline captured at the first successful equity read.
    initial: Option<Price>,
    current: Option<Price>,
}

/// Process-wide risk supervisor.
pub struct RiskSupervisor {
    config: RiskConfig,
    latch: Arc<KillLatch>,
    windows: Mutex<HashMap<Symbol, PriceWindow>>,
    /// Call outcomes inside the rolling error window.
    calls: Mutex<VecDeque<(Instant, bool)>>,
    /// Lifetime counters.
    api_calls_total: AtomicU64,
    api_calls_failed: AtomicU64,
    equity: Mutex<EquityState>,
    last_check_ms: AtomicI64,
}

impl RiskSupervisor {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            latch: Arc::new(KillLatch::new()),
            windows: Mutex::new(HashMap::new()),
            calls: Mutex::new(VecDeque::new()),
            api_calls_total: AtomicU64::new(0),
            api_calls_failed: AtomicU64::new(0),
            equity: Mutex::new(EquityState::default()),
            last_check_ms: AtomicI64::new(0),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// The shared kill latch.
    pub fn latch(&self) -> &Arc<KillLatch> {
        &self.latch
    }

    // === inputs ===

    /// Ingest a price tick: update the symbol's window, then re-evaluate
    /// kill conditions. Evaluation runs on every tick so a volatility
    /// burst trips the latch without waiting for the periodic check.
    pub fn record_tick(&self, tick: &PriceTick) {
        {
            let mut windows = self.windows.lock();
            windows
                .entry(tick.symbol.clone())
                .or_insert_with(|| {
                    PriceWindow::new(self.config.window_capacity, self.config.volatility_samples)
                })
                .push(tick.price, tick.ts_ms);
        }
        self.evaluate();
    }

    /// Ingest a wallet equity reading. The first successful reading
    /// becomes the drawdown baseline for the process lifetime.
    pub fn update_equity(&self, equity: Price) {
        let mut state = self.equity.lock();
        if state.initial.is_none() {
            info!(%equity, "Equity baseline captured");
            state.initial = Some(equity);
        }
        state.current = Some(equity);
        self.last_check_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    // === estimators ===

    /// Drawdown in percent; negative means loss. `None` until the
    /// baseline exists.
    pub fn drawdown_pct(&self) -> Option<Decimal> {
        let state = self.equity.lock();
        let initial = state.initial?;
        let current = state.current?;
        if initial.is_zero() {
            return None;
        }
        Some((current.inner() - initial.inner()) / initial.inner() * Decimal::from(100))
    }

    /// In-window API error rate in percent, and the in-window call count.
    pub fn api_error_rate_pct(&self) -> (Decimal, u64) {
        let mut calls = self.calls.lock();
        Self::prune_calls(&mut calls);
        let total = calls.len() as u64;
        if total == 0 {
            return (Decimal::ZERO, 0);
        }
        let failed = calls.iter().filter(|(_, ok)| !ok).count() as u64;
        (
            Decimal::from(failed) / Decimal::from(total) * Decimal::from(100),
            total,
        )
    }

    /// Current volatility estimate for a symbol, in percent.
    pub fn volatility_pct(&self, symbol: &Symbol) -> Option<Decimal> {
        self.windows.lock().get(symbol)?.volatility_pct()
    }

    /// Whether a symbol's volatility breaker is active.
    pub fn breaker_active(&self, symbol: &Symbol) -> bool {
        self.volatility_pct(symbol)
            .map(|v| v > self.config.volatility_threshold_pct)
            .unwrap_or(false)
    }

    /// Number of symbols whose breaker is active right now.
    pub fn active_breaker_count(&self) -> usize {
        let windows = self.windows.lock();
        windows
            .values()
            .filter_map(PriceWindow::volatility_pct)
            .filter(|v| *v > self.config.volatility_threshold_pct)
            .count()
    }

    /// Whether the BTC breaker is active (drives the BTC filter).
    pub fn btc_breaker_active(&self) -> bool {
        self.breaker_active(&Symbol::new(BTC_SYMBOL))
    }

    // === kill evaluation ===

    /// The kill condition that holds right now, independent of whether
    /// the latch is already set.
    pub fn current_kill_condition(&self) -> Option<String> {
        if let Some(dd) = self.drawdown_pct() {
            if dd <= -self.config.max_drawdown_pct {
                return Some(format!("Max drawdown exceeded: {:.1}%", dd));
            }
        }

        let (error_rate, total) = self.api_error_rate_pct();
        if total >= self.config.api_warmup_calls
            && error_rate >= self.config.max_api_error_rate_pct
        {
            return Some(format!("API error rate too high: {:.1}%", error_rate));
        }

        let breakers = self.active_breaker_count();
        if breakers >= self.config.volatility_breaker_count {
            return Some(format!("Volatility breakers triggered: {breakers}"));
        }

        None
    }

    /// Evaluate kill conditions and trip the latch on the first hit.
    pub fn evaluate(&self) {
        self.last_check_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::SeqCst);
        if self.latch.is_triggered() {
            return;
        }
        if let Some(reason) = self.current_kill_condition() {
            self.latch.trigger(reason);
        }
    }

    /// Operator-initiated kill.
    pub fn trigger_kill(&self, reason: impl Into<String>) {
        self.latch.trigger(reason);
    }

    /// Clear the latch, refusing while any kill condition still holds.
    pub fn reset_kill(&self) -> RiskResult<()> {
        if let Some(reason) = self.current_kill_condition() {
            warn!(%reason, "Kill reset refused");
            return Err(RiskError::ConditionStillActive(reason));
        }
        self.latch.reset();
        Ok(())
    }

    // === pre-trade gate ===

    /// Gate a worker's transition into RUNNING.
    pub fn allow_start(&self, check: &StartCheck) -> GateDecision {
        if self.latch.is_triggered() {
            let reason = self
                .latch
                .reason()
                .unwrap_or_else(|| "kill switch triggered".to_string());
            return GateDecision::Blocked(format!("Kill switch: {reason}"));
        }

        if let (Some(price), Some(stop_loss)) = (check.current_price, check.stop_loss) {
            if price <= stop_loss {
                return GateDecision::Blocked(format!(
                    "Stop-loss tripped for {}",
                    check.symbol
                ));
            }
        }

        if check.btc_filter_enabled && self.btc_breaker_active() {
            return GateDecision::Blocked(format!(
                "BTC volatility breaker active, {} placements suspended",
                check.symbol
            ));
        }

        if let Some(equity) = self.equity.lock().current {
            if !equity.is_zero() {
                let exposure_pct = check.investment / equity.inner() * Decimal::from(100);
                if exposure_pct > self.config.max_position_pct {
                    return GateDecision::Blocked(format!(
                        "Investment is {:.1}% of equity, above the {}% position limit",
                        exposure_pct, self.config.max_position_pct
                    ));
                }
            }
        }

        GateDecision::Allowed
    }

    // === snapshot ===

    pub fn snapshot(&self) -> RiskSnapshot {
        let (initial, current) = {
            let state = self.equity.lock();
            (state.initial, state.current)
        };
        let (error_rate, _) = self.api_error_rate_pct();
        let last_check_ms = self.last_check_ms.load(Ordering::SeqCst);
        let last_check = chrono::DateTime::from_timestamp_millis(last_check_ms)
            .unwrap_or_default()
            .to_rfc3339();

        RiskSnapshot {
            total_equity: decimal_to_f64(current.map(|p| p.inner()).unwrap_or_default()),
            initial_equity: decimal_to_f64(initial.map(|p| p.inner()).unwrap_or_default()),
            drawdown_percent: decimal_to_f64(self.drawdown_pct().unwrap_or_default()),
            api_error_rate: decimal_to_f64(error_rate),
            volatility_breakers: self.active_breaker_count(),
            kill_switch_triggered: self.latch.is_triggered(),
            kill_switch_reason: self.latch.reason(),
            potential_kill_reason: self.current_kill_condition(),
            last_check,
        }
    }

    fn prune_calls(calls: &mut VecDeque<(Instant, bool)>) {
        let cutoff = Instant::now() - ERROR_WINDOW;
        while calls.front().is_some_and(|(t, _)| *t < cutoff) {
            calls.pop_front();
        }
    }
}

impl CallObserver for RiskSupervisor {
    fn record_call(&self, success: bool) {
        self.api_calls_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.api_calls_failed.fetch_add(1, Ordering::Relaxed);
        }
        let mut calls = self.calls.lock();
        Self::prune_calls(&mut calls);
        calls.push_back((Instant::now(), success));
        if !success {
            debug!(
                in_window = calls.len(),
                "Exchange call failed, error budget charged"
            );
        }
    }
}

/// Periodic equity poller: reads `wallet_equity` on the configured
/// cadence, feeds the drawdown tracker, and re-evaluates kill
/// conditions. Runs for the process lifetime.
pub async fn run_equity_poller(supervisor: Arc<RiskSupervisor>, exchange: DynExchange) {
    let interval = Duration::from_secs(supervisor.config().equity_poll_secs);
    loop {
        match exchange.wallet_equity().await {
            Ok(equity) => supervisor.update_equity(equity),
            Err(e) => warn!(error = %e, "Equity poll failed"),
        }
        supervisor.evaluate();
        tokio::time::sleep(interval).await;
    }
}

fn decimal_to_f64(d: Decimal) -> f64 {
    d.to_string().parse().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tick(symbol: &str, price: Decimal, ts: i64) -> PriceTick {
        PriceTick::new(Symbol::new(symbol), Price::new(price), ts)
    }

    fn feed_flat(supervisor: &RiskSupervisor, symbol: &str, price: Decimal, n: usize) {
        for i in 0..n {
            supervisor.record_tick(&tick(symbol, price, i as i64 * 1000));
        }
    }

    fn feed_volatile(supervisor: &RiskSupervisor, symbol: &str, base: Decimal) {
        // Alternate ±8% around the base: deviation safely above 5%
        for i in 0i64..10 {
            let price = if i % 2 == 0 {
                base * dec!(1.08)
            } else {
                base * dec!(0.92)
            };
            supervisor.record_tick(&tick(symbol, price, i * 1000));
        }
    }

    #[test]
    fn test_volatility_breaker_activation() {
        let supervisor = RiskSupervisor::new(RiskConfig::default());
        let btc = Symbol::new("BTCUSDT");

        feed_flat(&supervisor, "BTCUSDT", dec!(97250), 10);
        assert!(!supervisor.breaker_active(&btc));

        feed_volatile(&supervisor, "BTCUSDT", dec!(97250));
        assert!(supervisor.breaker_active(&btc));
        assert!(supervisor.btc_breaker_active());
    }

    #[test]
    fn test_two_breakers_trigger_kill() {
        let supervisor = RiskSupervisor::new(RiskConfig::default());

        feed_volatile(&supervisor, "BTCUSDT", dec!(97250));
        assert!(!supervisor.latch().is_triggered());

        feed_volatile(&supervisor, "DOGEUSDT", dec!(0.137));

        assert_eq!(supervisor.active_breaker_count(), 2);
        assert!(supervisor.latch().is_triggered());
        let reason = supervisor.latch().reason().unwrap();
        assert!(reason.contains("Volatility breakers"), "reason = {reason}");
    }

    #[test]
    fn test_drawdown_kill() {
        let supervisor = RiskSupervisor::new(RiskConfig::default());

        supervisor.update_equity(Price::new(dec!(34000)));
        supervisor.evaluate();
        assert!(!supervisor.latch().is_triggered());

        // 35% below baseline
        supervisor.update_equity(Price::new(dec!(22100)));
        supervisor.evaluate();

        assert!(supervisor.latch().is_triggered());
        assert!(supervisor
            .latch()
            .reason()
            .unwrap()
            .contains("Max drawdown"));
    }

    #[test]
    fn test_equity_baseline_is_first_reading() {
        let supervisor = RiskSupervisor::new(RiskConfig::default());
        supervisor.update_equity(Price::new(dec!(34000)));
        supervisor.update_equity(Price::new(dec!(40000)));

        // Gain, not loss: drawdown positive
        let dd = supervisor.drawdown_pct().unwrap();
        assert!(dd > dec!(17) && dd < dec!(18), "dd = {dd}");
    }

    #[test]
    fn test_error_rate_warmup_guard() {
        let supervisor = RiskSupervisor::new(RiskConfig::default());

        // 10 calls, all failed: 100% error rate but below warm-up count
        for _ in 0..10 {
            supervisor.record_call(false);
        }
        supervisor.evaluate();
        assert!(!supervisor.latch().is_triggered());

        // Pass warm-up with the failure rate still above threshold
        for _ in 0..45 {
            supervisor.record_call(true);
        }
        supervisor.evaluate();
        // 10 failed / 55 total ≈ 18%
        assert!(supervisor.latch().is_triggered());
        assert!(supervisor
            .latch()
            .reason()
            .unwrap()
            .contains("API error rate"));
    }

    #[test]
    fn test_error_rate_below_threshold_no_kill() {
        let supervisor = RiskSupervisor::new(RiskConfig::default());

        supervisor.record_call(false);
        for _ in 0..99 {
            supervisor.record_call(true);
        }
        supervisor.evaluate();

        // 1% < 2% threshold
        assert!(!supervisor.latch().is_triggered());
    }

    #[test]
    fn test_reset_kill_refused_while_condition_holds() {
        let supervisor = RiskSupervisor::new(RiskConfig::default());

        feed_volatile(&supervisor, "BTCUSDT", dec!(97250));
        feed_volatile(&supervisor, "DOGEUSDT", dec!(0.137));
        assert!(supervisor.latch().is_triggered());

        let err = supervisor.reset_kill().unwrap_err();
        assert!(matches!(err, RiskError::ConditionStillActive(_)));
        assert!(supervisor.latch().is_triggered());
    }

    #[test]
    fn test_reset_kill_succeeds_after_manual_kill() {
        let supervisor = RiskSupervisor::new(RiskConfig::default());
        supervisor.trigger_kill("Manual kill switch activated");
        assert!(supervisor.latch().is_triggered());

        supervisor.reset_kill().unwrap();
        assert!(!supervisor.latch().is_triggered());
    }

    #[test]
    fn test_gate_blocks_on_kill() {
        let supervisor = RiskSupervisor::new(RiskConfig::default());
        supervisor.trigger_kill("Manual kill switch activated");

        let decision = supervisor.allow_start(&StartCheck {
            symbol: Symbol::new("BTCUSDT"),
            current_price: Some(Price::new(dec!(97250))),
            stop_loss: Some(Price::new(dec!(94800))),
            btc_filter_enabled: false,
            investment: dec!(25000),
        });
        assert!(!decision.is_allowed());
        assert!(decision.blocked_reason().unwrap().contains("Kill switch"));
    }

    #[test]
    fn test_gate_blocks_below_stop_loss() {
        let supervisor = RiskSupervisor::new(RiskConfig::default());

        let decision = supervisor.allow_start(&StartCheck {
            symbol: Symbol::new("BTCUSDT"),
            current_price: Some(Price::new(dec!(94750))),
            stop_loss: Some(Price::new(dec!(94800))),
            btc_filter_enabled: false,
            investment: dec!(25000),
        });
        assert_eq!(
            decision.blocked_reason(),
            Some("Stop-loss tripped for BTCUSDT")
        );
    }

    #[test]
    fn test_gate_blocks_btc_filter() {
        let supervisor = RiskSupervisor::new(RiskConfig::default());
        feed_volatile(&supervisor, "BTCUSDT", dec!(97250));

        let decision = supervisor.allow_start(&StartCheck {
            symbol: Symbol::new("PEPEUSDT"),
            current_price: Some(Price::new(dec!(0.00000445))),
            stop_loss: None,
            btc_filter_enabled: true,
            investment: dec!(1500),
        });
        assert!(!decision.is_allowed());
        assert!(decision
            .blocked_reason()
            .unwrap()
            .contains("BTC volatility breaker"));
    }

    #[test]
    fn test_gate_blocks_oversized_position() {
        let supervisor = RiskSupervisor::new(RiskConfig::default());
        supervisor.update_equity(Price::new(dec!(34000)));

        let decision = supervisor.allow_start(&StartCheck {
            symbol: Symbol::new("BTCUSDT"),
            current_price: Some(Price::new(dec!(97250))),
            stop_loss: None,
            btc_filter_enabled: false,
            investment: dec!(20000), // 58.8% of equity, above 50%
        });
        assert!(!decision.is_allowed());
        assert!(decision
            .blocked_reason()
            .unwrap()
            .contains("position limit"));
    }

    #[test]
    fn test_gate_allows_healthy_start() {
        let supervisor = RiskSupervisor::new(RiskConfig::default());
        supervisor.update_equity(Price::new(dec!(34000)));
        feed_flat(&supervisor, "BTCUSDT", dec!(97250), 10);

        let decision = supervisor.allow_start(&StartCheck {
            symbol: Symbol::new("BTCUSDT"),
            current_price: Some(Price::new(dec!(97250))),
            stop_loss: Some(Price::new(dec!(94800))),
            btc_filter_enabled: false,
            investment: dec!(15000),
        });
        assert!(decision.is_allowed());
    }

    #[test]
    fn test_snapshot_fields() {
        let supervisor = RiskSupervisor::new(RiskConfig::default());
        supervisor.update_equity(Price::new(dec!(34000)));
        supervisor.update_equity(Price::new(dec!(30600)));

        let snap = supervisor.snapshot();
        assert_eq!(snap.total_equity, 30600.0);
        assert_eq!(snap.initial_equity, 34000.0);
        assert!((snap.drawdown_percent + 10.0).abs() < 0.01);
        assert!(!snap.kill_switch_triggered);
        assert!(snap.kill_switch_reason.is_none());
        assert!(snap.potential_kill_reason.is_none());
    }
}

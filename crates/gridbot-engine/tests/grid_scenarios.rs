//! End-to-end grid scenarios against the mock exchange.
//!
//! These drive spawned workers through their real mailbox and tick
//! channels, with fills produced by the mock's crossing model.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::mpsc;

use gridbot_core::{OrderSide, OrderState, Price, PriceTick, Qty, Symbol};
use gridbot_engine::{
    default_deployments, spawn_worker, Controller, EngineError, GridParameters, GridStatus,
    WorkerHandle,
};
use gridbot_exchange::{
    CallObserver, Exchange, MeteredExchange, MockExchange, NullObserver, RateLimiter,
};
use gridbot_feed::PriceFeed;
use gridbot_persistence::NullStore;
use gridbot_risk::{RiskConfig, RiskSupervisor};

fn btc() -> Symbol {
    Symbol::new("BTCUSDT")
}

fn btc_params() -> GridParameters {
    default_deployments().remove(0)
}

/// Spawn a worker with a hand-fed tick channel.
fn spawn_test_worker(
    mock: Arc<MockExchange>,
    params: GridParameters,
) -> (WorkerHandle, mpsc::Sender<PriceTick>, Arc<RiskSupervisor>) {
    let risk = Arc::new(RiskSupervisor::new(RiskConfig::default()));
    let (tick_tx, tick_rx) = mpsc::channel(64);
    let handle = spawn_worker(params, mock, risk.clone(), Arc::new(NullStore), tick_rx);
    (handle, tick_tx, risk)
}

/// Move the market: fill crossing orders at the exchange, then deliver
/// the tick to the worker.
async fn step_price(
    mock: &MockExchange,
    tick_tx: &mpsc::Sender<PriceTick>,
    symbol: &Symbol,
    price: Decimal,
    ts_ms: i64,
) {
    mock.set_price(symbol, Price::new(price));
    tick_tx
        .send(PriceTick::new(symbol.clone(), Price::new(price), ts_ms))
        .await
        .expect("worker alive");
}

fn future_ts(step: i64) -> i64 {
    chrono::Utc::now().timestamp_millis() + step * 1000
}

// ============================================================================
// Scenario: cold start, monotonic drop then rise
// ============================================================================

#[tokio::test]
async fn cold_start_drop_then_rise_books_profit() {
    let mock = Arc::new(MockExchange::new());
    mock.seed_price(&btc(), Price::new(dec!(97250)));
    let (worker, tick_tx, _risk) = spawn_test_worker(mock.clone(), btc_params());

    let started = worker.start().await.unwrap();
    // Price 97250 sits in band 6: levels 0..=5 get buys, no sells cold
    assert_eq!(started.orders_placed, 6);
    assert_eq!(mock.open_order_count(&btc()), 6);

    for (i, price) in [
        dec!(96100),
        dec!(95700),
        dec!(96200),
        dec!(97000),
        dec!(97700),
    ]
    .into_iter()
    .enumerate()
    {
        step_price(&mock, &tick_tx, &btc(), price, future_ts(i as i64 + 1)).await;
    }

    let snap = worker.snapshot().await.unwrap();
    assert!(snap.total_buys >= 2, "total_buys = {}", snap.total_buys);
    assert_eq!(snap.total_sells, snap.total_buys);
    assert_eq!(snap.filled_levels, 0, "every holding was sold");
    assert!(snap.realized_pnl > 0.0);

    // Each matched cycle earns qty * spacing; check the sum shape:
    // spacing = 291.666..., every level qty ≈ 2083.33 / level_price
    let params = btc_params();
    let spacing = params.spacing().inner();
    let max_expected: Decimal = (0..params.grid_count)
        .map(|i| params.level_qty(i).inner() * spacing)
        .sum();
    let pnl = Decimal::try_from(snap.realized_pnl).unwrap_or_default();
    assert!(pnl <= max_expected);
}

// ============================================================================
// Scenario: stop-loss trip is sticky
// ============================================================================

#[tokio::test]
async fn stop_loss_trip_blocks_restart_until_acknowledged() {
    let mock = Arc::new(MockExchange::new());
    mock.seed_price(&btc(), Price::new(dec!(97250)));
    let (worker, tick_tx, _risk) = spawn_test_worker(mock.clone(), btc_params());
    worker.start().await.unwrap();

    // 94750 is below the 94800 stop loss
    step_price(&mock, &tick_tx, &btc(), dec!(94750), future_ts(1)).await;

    let snap = worker.snapshot().await.unwrap();
    assert_eq!(snap.status, GridStatus::Paused);
    assert!(snap.stop_loss_tripped);
    assert_eq!(mock.open_order_count(&btc()), 0);

    let err = worker.start().await.unwrap_err();
    assert_eq!(err.to_string(), "Stop-loss tripped for BTCUSDT");
    assert!(matches!(err, EngineError::StopLossTripped(_)));

    // Explicit stop acknowledges the trip; restart succeeds once the
    // price is back inside the band
    worker.stop().await.unwrap();
    step_price(&mock, &tick_tx, &btc(), dec!(97250), future_ts(2)).await;
    let restarted = worker.start().await.unwrap();
    assert!(restarted.orders_placed > 0);
}

// ============================================================================
// Scenario: rebalance atomicity
// ============================================================================

#[tokio::test]
async fn rebalance_replaces_grid_under_new_epoch() {
    let mock = Arc::new(MockExchange::new());
    mock.seed_price(&btc(), Price::new(dec!(97250)));
    let (worker, _tick_tx, _risk) = spawn_test_worker(mock.clone(), btc_params());
    worker.start().await.unwrap();

    let before: Vec<String> = {
        let open = mock.open_orders(&btc()).await.unwrap();
        open.into_iter().map(|o| o.order_id).collect()
    };
    assert_eq!(before.len(), 6);

    let outcome = worker.rebalance().await.unwrap();
    assert_eq!(outcome.stopped.cancelled, 6);
    assert!(outcome.stopped.remaining.is_empty());
    assert_eq!(outcome.started.orders_placed, 6);

    // Old orders are cancelled at the exchange, new grid is resting
    for order_id in &before {
        assert_eq!(mock.order_state(order_id), Some(OrderState::Cancelled));
    }
    let after = mock.open_orders(&btc()).await.unwrap();
    assert_eq!(after.len(), 6);
    for order in &after {
        assert!(!before.contains(&order.order_id));
    }
}

// ============================================================================
// Scenario: crash-restart reconciliation
// ============================================================================

#[tokio::test]
async fn restart_adopts_grid_orders_and_cancels_strays() {
    let mock = Arc::new(MockExchange::new());
    mock.seed_price(&btc(), Price::new(dec!(97250)));
    let params = btc_params();

    // Four resting buys at recognizable grid prices plus one stray
    let mut seeded = Vec::new();
    for i in 0..4 {
        seeded.push(mock.seed_open_order(
            &btc(),
            OrderSide::Buy,
            params.level_price(i),
            params.level_qty(i),
        ));
    }
    let stray = mock.seed_open_order(
        &btc(),
        OrderSide::Buy,
        Price::new(dec!(90000)),
        Qty::new(dec!(0.01)),
    );

    let (worker, _tick_tx, _risk) = spawn_test_worker(mock.clone(), params);
    let outcome = worker.start().await.unwrap();

    assert_eq!(outcome.adopted, 4);
    assert_eq!(outcome.orders_placed, 2);
    assert_eq!(mock.order_state(&stray), Some(OrderState::Cancelled));
    for order_id in &seeded {
        assert_eq!(mock.order_state(order_id), Some(OrderState::New));
    }
    assert_eq!(mock.open_order_count(&btc()), 6);
}

// ============================================================================
// Scenario: kill supremacy
// ============================================================================

#[tokio::test]
async fn kill_preempts_and_no_orders_until_reset() {
    let mock = Arc::new(MockExchange::new());
    mock.seed_price(&btc(), Price::new(dec!(97250)));
    mock.seed_price(&Symbol::new("DOGEUSDT"), Price::new(dec!(0.137)));

    let risk = Arc::new(RiskSupervisor::new(RiskConfig::default()));
    let feed = PriceFeed::new(mock.clone(), vec![]);
    let feed_handle = feed.handle();
    let controller = Controller::new(
        mock.clone(),
        risk.clone(),
        Arc::new(NullStore),
        feed_handle.clone(),
    );

    let deployments = default_deployments();
    controller.deploy(deployments[0].clone()).await.unwrap();
    controller.deploy(deployments[2].clone()).await.unwrap();
    controller.start(&btc()).await.unwrap();

    let results = controller.kill("Manual kill switch activated").await;
    for (_, result) in &results {
        assert!(result.is_ok());
    }
    assert_eq!(mock.open_order_count(&btc()), 0);

    // Ticks keep flowing; killed workers must not place anything
    for i in 1..=3 {
        feed_handle.publish(PriceTick::new(
            btc(),
            Price::new(dec!(96100)),
            future_ts(i),
        ));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(mock.open_order_count(&btc()), 0);

    let err = controller.start(&btc()).await.unwrap_err();
    assert!(matches!(err, EngineError::KilledByRisk(_)));

    // Reset clears the way again
    controller.reset_kill().unwrap();
    let outcome = controller.start(&btc()).await.unwrap();
    assert!(outcome.orders_placed > 0);
}

// ============================================================================
// Property: rate-limit adherence
// ============================================================================

#[tokio::test]
async fn metered_exchange_respects_token_rate() {
    let mock = Arc::new(MockExchange::new());
    mock.seed_price(&btc(), Price::new(dec!(97250)));

    let limiter = Arc::new(RateLimiter::new(5, 1));
    let metered = Arc::new(MeteredExchange::new(
        mock,
        limiter.clone(),
        Arc::new(NullObserver),
    ));

    let done = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let mut tasks = Vec::new();
    for _ in 0..12 {
        let exchange = metered.clone();
        let done = done.clone();
        tasks.push(tokio::spawn(async move {
            exchange.wallet_equity().await.unwrap();
            done.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));
    }

    // While calls drain, the one-second window never exceeds the rate
    while done.load(std::sync::atomic::Ordering::SeqCst) < 12 {
        assert!(limiter.current_count() <= 5);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    for task in tasks {
        task.await.unwrap();
    }
}

// ============================================================================
// Property: error budget feeds the kill latch through real traffic
// ============================================================================

#[tokio::test]
async fn api_failures_through_metered_wrapper_reach_risk() {
    let mock = Arc::new(MockExchange::new());
    let risk = Arc::new(RiskSupervisor::new(RiskConfig::default()));
    let metered = MeteredExchange::new(
        mock.clone(),
        Arc::new(RateLimiter::new(1000, 1)),
        risk.clone() as Arc<dyn CallObserver>,
    );

    for _ in 0..10 {
        mock.fail_next(gridbot_exchange::ExchangeError::Transient("down".into()));
        let _ = metered.wallet_equity().await;
    }
    for _ in 0..45 {
        metered.wallet_equity().await.unwrap();
    }

    risk.evaluate();
    // 10 failures / 55 calls ≈ 18% with the warm-up satisfied
    assert!(risk.latch().is_triggered());
}

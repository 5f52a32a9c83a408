//! Application wiring.
//!
//! Builds the object graph: exchange transport (real or mock), metered
//! wrapper, risk supervisor, price feed, persistence, controller, and
//! the HTTP control surface. Absence of exchange credentials selects
//! the mock exchange with its deterministic price walk.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{error, info, warn};

use gridbot_core::Price;
use gridbot_engine::Controller;
use gridbot_exchange::{
    mock_with_default_prices, BybitCredentials, BybitExchange, CallObserver, DynExchange,
    MeteredExchange, RateLimiter,
};
use gridbot_feed::{run_feed, FeedHandle};
use gridbot_persistence::{DynStore, JsonlStore, NullStore, StoreEvent};
use gridbot_risk::{run_equity_poller, RiskSupervisor};
use gridbot_server::{run_server, AlertRouter, AppState};

use crate::config::AppConfig;
use crate::error::AppResult;

/// The wired application, ready to run.
pub struct Application {
    config: AppConfig,
    risk: Arc<RiskSupervisor>,
    exchange: DynExchange,
    store: DynStore,
    feed: FeedHandle,
    controller: Arc<Controller>,
    alerts: Arc<AlertRouter>,
}

impl Application {
    pub async fn new(config: AppConfig) -> AppResult<Self> {
        let risk = Arc::new(RiskSupervisor::new(config.risk.clone()));

        // Transport: real Bybit when credentials exist, mock otherwise
        let inner: DynExchange = match BybitCredentials::from_env() {
            Some(credentials) => {
                info!(testnet = credentials.testnet, "Using Bybit exchange");
                Arc::new(BybitExchange::new(credentials)?)
            }
            None => {
                warn!("No BYBIT_API_KEY set, running on the mock exchange");
                let mock = mock_with_default_prices();
                // Seed mid prices for any custom deployments so the
                // synthetic walk covers them too
                for params in config.deployments() {
                    let mid = (params.lower_price.inner() + params.upper_price.inner())
                        / Decimal::TWO;
                    mock.seed_price(&params.symbol, Price::new(mid));
                }
                mock
            }
        };

        let limiter = Arc::new(RateLimiter::new(config.rate_limit.calls_per_second, 1));
        let exchange: DynExchange = Arc::new(MeteredExchange::new(
            inner,
            limiter,
            risk.clone() as Arc<dyn CallObserver>,
        ));

        let store: DynStore = if config.persistence.enabled {
            let data_dir = std::env::var("GRIDBOT_DATA_DIR")
                .unwrap_or_else(|_| config.persistence.data_dir.clone());
            info!(%data_dir, "Persisting events to JSON Lines");
            Arc::new(JsonlStore::spawn(data_dir))
        } else {
            info!("Persistence disabled, running on the null store");
            Arc::new(NullStore)
        };

        let symbols = config
            .deployments()
            .iter()
            .map(|p| p.symbol.clone())
            .collect();
        let feed = run_feed(exchange.clone(), symbols);

        let controller = Arc::new(Controller::new(
            exchange.clone(),
            risk.clone(),
            store.clone(),
            feed.clone(),
        ));

        let alerts = Arc::new(AlertRouter::new(
            std::env::var("GRIDBOT_WEBHOOK_SECRET").ok(),
        ));

        Ok(Self {
            config,
            risk,
            exchange,
            store,
            feed,
            controller,
            alerts,
        })
    }

    /// Deploy grids, start the background tasks, and serve until
    /// shutdown.
    pub async fn run(self) -> AppResult<()> {
        for params in self.config.deployments() {
            let symbol = params.symbol.clone();
            if let Err(e) = self.controller.deploy(params).await {
                error!(%symbol, error = %e, "Deploy failed");
            }
        }

        // Risk and persistence consume the tick firehose
        {
            let risk = self.risk.clone();
            let store = self.store.clone();
            let mut ticks = self.feed.subscribe_all();
            tokio::spawn(async move {
                while let Some(tick) = ticks.recv().await {
                    risk.record_tick(&tick);
                    store.record(StoreEvent::Tick {
                        ts_ms: tick.ts_ms,
                        symbol: tick.symbol.to_string(),
                        price: tick.price.to_string(),
                    });
                }
            });
        }

        // Equity poller feeds the drawdown tracker
        tokio::spawn(run_equity_poller(self.risk.clone(), self.exchange.clone()));

        let state = AppState {
            controller: self.controller.clone(),
            feed: self.feed.clone(),
            alerts: self.alerts.clone(),
            store: self.store.clone(),
        };
        let port = self.config.server.port;

        tokio::select! {
            result = run_server(state, port) => {
                result?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested; resting orders stay for restart reconciliation");
            }
        }

        Ok(())
    }
}

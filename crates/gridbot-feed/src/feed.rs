//! Feed task and fanout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use gridbot_core::{PriceTick, Symbol};
use gridbot_exchange::DynExchange;

/// Capacity of each subscriber channel. A subscriber that falls this
/// far behind starts losing ticks rather than stalling the feed.
const SUBSCRIBER_CAPACITY: usize = 64;

/// Poll cadence in fallback mode.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Delay before re-attempting the stream after it dies.
const STREAM_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Subscribers {
    per_symbol: HashMap<Symbol, Vec<mpsc::Sender<PriceTick>>>,
    firehose: Vec<mpsc::Sender<PriceTick>>,
}

struct FeedShared {
    subscribers: Mutex<Subscribers>,
    /// Latest accepted tick per symbol, for `GET /api/prices`.
    cache: RwLock<HashMap<Symbol, PriceTick>>,
    /// Monotonic guard: last accepted timestamp per symbol.
    last_ts: Mutex<HashMap<Symbol, i64>>,
    /// Symbols the feed polls for (stream subscription is fixed at
    /// startup; symbols deployed later are covered by polling).
    symbols: Mutex<Vec<Symbol>>,
}

/// Cloneable handle to the feed.
#[derive(Clone)]
pub struct FeedHandle {
    shared: Arc<FeedShared>,
}

impl FeedHandle {
    /// Subscribe to one symbol's ticks.
    pub fn subscribe(&self, symbol: &Symbol) -> mpsc::Receiver<PriceTick> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.shared
            .subscribers
            .lock()
            .per_symbol
            .entry(symbol.clone())
            .or_default()
            .push(tx);
        rx
    }

    /// Subscribe to every tick (risk supervisor, persistence).
    pub fn subscribe_all(&self) -> mpsc::Receiver<PriceTick> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.shared.subscribers.lock().firehose.push(tx);
        rx
    }

    /// Latest accepted tick for a symbol.
    pub fn cached(&self, symbol: &Symbol) -> Option<PriceTick> {
        self.shared.cache.read().get(symbol).cloned()
    }

    /// Latest accepted tick for every symbol.
    pub fn cached_all(&self) -> Vec<PriceTick> {
        self.shared.cache.read().values().cloned().collect()
    }

    /// Register a symbol deployed after startup; it is covered by the
    /// polling path until the next stream (re)subscribe.
    pub fn add_symbol(&self, symbol: Symbol) {
        let mut symbols = self.shared.symbols.lock();
        if !symbols.contains(&symbol) {
            symbols.push(symbol);
        }
    }

    /// Inject a tick directly. Runs the same monotonic guard and fanout
    /// as the transport paths.
    pub fn publish(&self, tick: PriceTick) {
        dispatch(&self.shared, tick);
    }
}

/// The feed task state.
pub struct PriceFeed {
    exchange: DynExchange,
    shared: Arc<FeedShared>,
}

impl PriceFeed {
    pub fn new(exchange: DynExchange, symbols: Vec<Symbol>) -> Self {
        let shared = Arc::new(FeedShared {
            subscribers: Mutex::new(Subscribers::default()),
            cache: RwLock::new(HashMap::new()),
            last_ts: Mutex::new(HashMap::new()),
            symbols: Mutex::new(symbols),
        });
        Self { exchange, shared }
    }

    pub fn handle(&self) -> FeedHandle {
        FeedHandle {
            shared: self.shared.clone(),
        }
    }

    /// Run the feed until the process shuts down.
    ///
    /// Prefers the streaming transport; on failure or stream end, polls
    /// the REST ticker for one retry window, then attempts the stream
    /// again.
    pub async fn run(self) {
        loop {
            let symbols = self.shared.symbols.lock().clone();
            match self.exchange.subscribe(&symbols).await {
                Ok(mut stream) => {
                    info!(symbols = symbols.len(), "Feed streaming");
                    while let Some(tick) = stream.recv().await {
                        dispatch(&self.shared, tick);
                    }
                    warn!("Tick stream closed, falling back to polling");
                }
                Err(e) => {
                    warn!(error = %e, "Stream subscribe failed, falling back to polling");
                }
            }

            self.poll_window(STREAM_RETRY_DELAY).await;
        }
    }

    /// Poll the REST ticker for all registered symbols for `window`.
    async fn poll_window(&self, window: Duration) {
        let deadline = tokio::time::Instant::now() + window;
        while tokio::time::Instant::now() < deadline {
            let symbols = self.shared.symbols.lock().clone();
            for symbol in symbols {
                match self.exchange.ticker(&symbol).await {
                    Ok(tick) => dispatch(&self.shared, tick),
                    Err(e) => debug!(%symbol, error = %e, "Ticker poll failed"),
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Spawn the feed task, returning its handle.
pub fn run_feed(exchange: DynExchange, symbols: Vec<Symbol>) -> FeedHandle {
    let feed = PriceFeed::new(exchange, symbols);
    let handle = feed.handle();
    tokio::spawn(feed.run());
    handle
}

fn dispatch(shared: &Arc<FeedShared>, tick: PriceTick) {
    // Monotonic guard: drop ticks older than the last accepted one
    {
        let mut last_ts = shared.last_ts.lock();
        match last_ts.get(&tick.symbol) {
            Some(&last) if tick.ts_ms < last => {
                debug!(symbol = %tick.symbol, ts = tick.ts_ms, last, "Dropping out-of-order tick");
                return;
            }
            _ => {
                last_ts.insert(tick.symbol.clone(), tick.ts_ms);
            }
        }
    }

    shared
        .cache
        .write()
        .insert(tick.symbol.clone(), tick.clone());

    let mut subscribers = shared.subscribers.lock();
    if let Some(list) = subscribers.per_symbol.get_mut(&tick.symbol) {
        list.retain(|tx| match tx.try_send(tick.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(symbol = %tick.symbol, "Subscriber lagging, tick dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
    subscribers.firehose.retain(|tx| match tx.try_send(tick.clone()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => true,
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    });
}

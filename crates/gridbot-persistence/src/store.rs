//! Store implementations.
//!
//! JSON Lines format for the file backend:
//! - each line is a complete JSON object
//! - partial corruption only affects individual lines
//! - append mode survives interrupted writes
//!
//! Files are partitioned per day and per event family, e.g.
//! `trades_2026-08-02.jsonl`.

use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::StoreResult;
use crate::event::{EventKind, StoreEvent};

/// Default bound on the in-memory event queue.
const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Append-only event sink. `record` must never block the caller.
pub trait Store: Send + Sync {
    /// Enqueue an event, fire-and-forget.
    fn record(&self, event: StoreEvent);
}

/// Shared handle to a boxed store.
pub type DynStore = Arc<dyn Store>;

/// Store that discards everything. The core runs correctly on it.
#[derive(Debug, Default)]
pub struct NullStore;

impl Store for NullStore {
    fn record(&self, _event: StoreEvent) {}
}

// ============================================================================
// JSON Lines store
// ============================================================================

struct EventQueue {
    events: VecDeque<StoreEvent>,
    capacity: usize,
    dropped_ticks: u64,
}

impl EventQueue {
    /// Push with shedding: on overflow, evict the oldest sheddable
    /// event (ticks) first; when none exists, drop the incoming event
    /// if it is itself sheddable, else evict the oldest event outright.
    fn push(&mut self, event: StoreEvent) {
        if self.events.len() >= self.capacity {
            if let Some(pos) = self.events.iter().position(|e| e.kind().is_sheddable()) {
                let _ = self.events.remove(pos);
                self.dropped_ticks += 1;
            } else if event.kind().is_sheddable() {
                self.dropped_ticks += 1;
                return;
            } else {
                self.events.pop_front();
            }
        }
        self.events.push_back(event);
    }
}

/// JSON-Lines file store with a bounded queue and a writer task.
pub struct JsonlStore {
    queue: Arc<Mutex<EventQueue>>,
    notify: Arc<Notify>,
}

impl JsonlStore {
    /// Create the store and spawn its writer task.
    pub fn spawn(data_dir: impl Into<PathBuf>) -> Self {
        Self::spawn_with_capacity(data_dir, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn spawn_with_capacity(data_dir: impl Into<PathBuf>, capacity: usize) -> Self {
        let data_dir = data_dir.into();
        let queue = Arc::new(Mutex::new(EventQueue {
            events: VecDeque::with_capacity(capacity),
            capacity,
            dropped_ticks: 0,
        }));
        let notify = Arc::new(Notify::new());

        let writer_queue = queue.clone();
        let writer_notify = notify.clone();
        tokio::spawn(async move {
            run_writer(data_dir, writer_queue, writer_notify).await;
        });

        Self { queue, notify }
    }

    /// Events dropped under queue pressure so far (ticks only, unless
    /// the queue was saturated with critical events).
    pub fn dropped_count(&self) -> u64 {
        self.queue.lock().dropped_ticks
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.queue.lock().events.len()
    }
}

impl Store for JsonlStore {
    fn record(&self, event: StoreEvent) {
        self.queue.lock().push(event);
        self.notify.notify_one();
    }
}

/// Writer task: drains the queue in batches and appends to daily files.
async fn run_writer(data_dir: PathBuf, queue: Arc<Mutex<EventQueue>>, notify: Arc<Notify>) {
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        warn!(?e, dir = %data_dir.display(), "Failed to create data directory");
    }
    info!(dir = %data_dir.display(), "JSON Lines store started");

    let mut writers = FamilyWriters::new(data_dir);

    loop {
        notify.notified().await;

        let batch: Vec<StoreEvent> = {
            let mut q = queue.lock();
            q.events.drain(..).collect()
        };

        for event in batch {
            if let Err(e) = writers.append(&event) {
                warn!(?e, kind = ?event.kind(), "Failed to persist event");
            }
        }
        writers.flush();
    }
}

struct ActiveWriter {
    writer: BufWriter<File>,
    date: String,
}

/// One open file per event family, rotated daily.
struct FamilyWriters {
    data_dir: PathBuf,
    active: HashMap<EventKind, ActiveWriter>,
}

impl FamilyWriters {
    fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            active: HashMap::new(),
        }
    }

    fn append(&mut self, event: &StoreEvent) -> StoreResult<()> {
        let kind = event.kind();
        let today = Utc::now().format("%Y-%m-%d").to_string();

        let rotate = self
            .active
            .get(&kind)
            .map(|w| w.date != today)
            .unwrap_or(true);

        if rotate {
            let filename = self
                .data_dir
                .join(format!("{}_{today}.jsonl", kind.file_prefix()));
            debug!(file = %filename.display(), "Opening event file (append mode)");
            let file = OpenOptions::new().create(true).append(true).open(&filename)?;
            self.active.insert(
                kind,
                ActiveWriter {
                    writer: BufWriter::new(file),
                    date: today,
                },
            );
        }

        let active = self.active.get_mut(&kind).expect("writer just inserted");
        let json = serde_json::to_string(event)?;
        writeln!(active.writer, "{json}")?;
        Ok(())
    }

    fn flush(&mut self) {
        for active in self.active.values_mut() {
            if let Err(e) = active.writer.flush() {
                warn!(?e, "Event file flush failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick_event(n: i64) -> StoreEvent {
        StoreEvent::Tick {
            ts_ms: n,
            symbol: "BTCUSDT".to_string(),
            price: "97250".to_string(),
        }
    }

    fn trade_event(n: i64) -> StoreEvent {
        StoreEvent::Trade {
            ts_ms: n,
            symbol: "BTCUSDT".to_string(),
            side: "sell".to_string(),
            price: "96520.83".to_string(),
            qty: "0.0259".to_string(),
            order_id: format!("mock_{n}"),
            pnl: "7.55".to_string(),
        }
    }

    #[test]
    fn test_queue_sheds_ticks_before_trades() {
        let mut queue = EventQueue {
            events: VecDeque::new(),
            capacity: 4,
            dropped_ticks: 0,
        };

        queue.push(tick_event(1));
        queue.push(trade_event(2));
        queue.push(tick_event(3));
        queue.push(trade_event(4));
        assert_eq!(queue.events.len(), 4);

        // Overflow: the oldest tick goes, the new trade stays
        queue.push(trade_event(5));
        assert_eq!(queue.events.len(), 4);
        assert_eq!(queue.dropped_ticks, 1);
        let kinds: Vec<EventKind> = queue.events.iter().map(StoreEvent::kind).collect();
        assert_eq!(kinds.iter().filter(|k| **k == EventKind::Trade).count(), 3);
    }

    #[test]
    fn test_queue_drops_incoming_tick_when_full_of_trades() {
        let mut queue = EventQueue {
            events: VecDeque::new(),
            capacity: 2,
            dropped_ticks: 0,
        };
        queue.push(trade_event(1));
        queue.push(trade_event(2));

        queue.push(tick_event(3));
        assert_eq!(queue.events.len(), 2);
        assert_eq!(queue.dropped_ticks, 1);
        assert!(queue.events.iter().all(|e| e.kind() == EventKind::Trade));
    }

    #[tokio::test]
    async fn test_record_is_nonblocking_and_queues() {
        let dir = std::env::temp_dir().join("gridbot-store-test");
        let store = JsonlStore::spawn_with_capacity(dir, 16);

        store.record(trade_event(1));
        // Either still queued or already drained by the writer; both fine
        assert!(store.queued() <= 1);
        assert_eq!(store.dropped_count(), 0);
    }

    #[test]
    fn test_null_store_accepts_everything() {
        let store = NullStore;
        store.record(tick_event(1));
        store.record(trade_event(2));
    }
}

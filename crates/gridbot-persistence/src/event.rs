//! Persisted event model.
//!
//! One enum per event family, mirroring the append-only tables of the
//! deployment database: trades, grid config snapshots, order lifecycle,
//! ticks, kill events, alert history.

use serde::{Deserialize, Serialize};

/// Event family, used for file routing and shedding priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Trade,
    GridConfig,
    OrderLifecycle,
    Tick,
    Kill,
    Alert,
}

impl EventKind {
    /// File prefix for this family.
    pub fn file_prefix(&self) -> &'static str {
        match self {
            Self::Trade => "trades",
            Self::GridConfig => "grid_configs",
            Self::OrderLifecycle => "orders",
            Self::Tick => "ticks",
            Self::Kill => "kills",
            Self::Alert => "alerts",
        }
    }

    /// Whether this family may be shed under queue pressure.
    pub fn is_sheddable(&self) -> bool {
        matches!(self, Self::Tick)
    }
}

/// A persisted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreEvent {
    /// A matched fill on the grid.
    Trade {
        ts_ms: i64,
        symbol: String,
        side: String,
        price: String,
        qty: String,
        order_id: String,
        pnl: String,
    },
    /// Deployed grid parameters.
    GridConfig {
        ts_ms: i64,
        symbol: String,
        lower_price: String,
        upper_price: String,
        grid_count: u32,
        total_investment: String,
    },
    /// An order transitioned state.
    OrderLifecycle {
        ts_ms: i64,
        symbol: String,
        order_id: String,
        level: u32,
        side: String,
        state: String,
    },
    /// A price observation.
    Tick {
        ts_ms: i64,
        symbol: String,
        price: String,
    },
    /// The kill latch tripped or reset.
    Kill {
        ts_ms: i64,
        triggered: bool,
        reason: Option<String>,
    },
    /// A webhook alert was received.
    Alert {
        ts_ms: i64,
        symbol: String,
        action: String,
        accepted: bool,
        detail: Option<String>,
    },
}

impl StoreEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Trade { .. } => EventKind::Trade,
            Self::GridConfig { .. } => EventKind::GridConfig,
            Self::OrderLifecycle { .. } => EventKind::OrderLifecycle,
            Self::Tick { .. } => EventKind::Tick,
            Self::Kill { .. } => EventKind::Kill,
            Self::Alert { .. } => EventKind::Alert,
        }
    }
}

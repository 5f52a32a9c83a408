//! Price tick type shared by the feed, the exchange stream, and risk.

use crate::{Price, Symbol};
use serde::{Deserialize, Serialize};

/// A single observed price for a symbol.
///
/// `ts_ms` is the exchange timestamp in Unix milliseconds. Consumers must
/// treat ticks per symbol as a monotonic stream; out-of-order ticks are
/// dropped at the feed boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub symbol: Symbol,
    pub price: Price,
    pub ts_ms: i64,
}

impl PriceTick {
    pub fn new(symbol: Symbol, price: Price, ts_ms: i64) -> Self {
        Self {
            symbol,
            price,
            ts_ms,
        }
    }
}

//! A single grid level.

use gridbot_core::{Price, Qty};
use serde::{Deserialize, Serialize};

/// One price level of the grid with its order slots.
///
/// Invariant: at most one of `buy_order_id` / `sell_order_id` is set.
/// A level cycles buy → holding → sell → buy; partial fills accumulate
/// in `filled_qty` until the remainder drops below the lot step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridLevel {
    /// 0 = lowest level.
    pub index: u32,
    /// Center-aligned level price.
    pub price: Price,
    /// Quantity traded at this level (lot-rounded once, reused for the
    /// matching sell).
    pub qty: Qty,
    pub buy_order_id: Option<String>,
    pub sell_order_id: Option<String>,
    /// A filled buy awaits its matching sell.
    pub holding: bool,
    /// Accumulated partial-fill quantity of the open order.
    pub filled_qty: Qty,
    /// Epoch under which the current order ids were issued.
    pub epoch: u64,
    /// A terminal placement error parked this level; it is skipped
    /// until the next start/rebalance regenerates the grid.
    pub faulted: bool,
    /// Unix milliseconds of the last order transition.
    pub last_transition_ms: i64,
}

impl GridLevel {
    pub fn new(index: u32, price: Price, qty: Qty) -> Self {
        Self {
            index,
            price,
            qty,
            buy_order_id: None,
            sell_order_id: None,
            holding: false,
            filled_qty: Qty::ZERO,
            epoch: 0,
            faulted: false,
            last_transition_ms: 0,
        }
    }

    /// Whether any order slot is occupied.
    pub fn has_open_order(&self) -> bool {
        self.buy_order_id.is_some() || self.sell_order_id.is_some()
    }

    /// Remaining quantity of the open order after partial fills.
    pub fn remaining_qty(&self) -> Qty {
        self.qty.saturating_sub(self.filled_qty)
    }

    /// Clear both order slots and the partial-fill accumulator.
    pub fn clear_orders(&mut self, now_ms: i64) {
        self.buy_order_id = None;
        self.sell_order_id = None;
        self.filled_qty = Qty::ZERO;
        self.last_transition_ms = now_ms;
    }
}

//! Grid state and its read-only snapshot.

use gridbot_core::Price;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::level::GridLevel;
use crate::params::GridParameters;

/// Worker lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GridStatus {
    Stopped,
    Running,
    Paused,
    Killed,
}

impl std::fmt::Display for GridStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Killed => write!(f, "killed"),
        }
    }
}

/// The grid state owned exclusively by one worker task.
#[derive(Debug)]
pub struct GridState {
    pub params: GridParameters,
    pub levels: Vec<GridLevel>,
    pub current_price: Option<Price>,
    pub status: GridStatus,
    pub total_buys: u64,
    pub total_sells: u64,
    pub realized_pnl: Decimal,
    pub last_tick_ms: i64,
    /// Bumped on every stop/rebalance; responses from older epochs are
    /// discarded without touching state.
    pub epoch: u64,
    /// Sticky until an explicit stop acknowledges it.
    pub stop_loss_tripped: bool,
}

impl GridState {
    pub fn new(params: GridParameters) -> Self {
        Self {
            params,
            levels: Vec::new(),
            current_price: None,
            status: GridStatus::Stopped,
            total_buys: 0,
            total_sells: 0,
            realized_pnl: Decimal::ZERO,
            last_tick_ms: 0,
            epoch: 0,
            stop_loss_tripped: false,
        }
    }

    /// Regenerate levels from the parameters (start and rebalance).
    pub fn build_levels(&mut self) {
        self.levels = (0..self.params.grid_count)
            .map(|i| GridLevel::new(i, self.params.level_price(i), self.params.level_qty(i)))
            .collect();
    }

    /// Deep-copied read-only view.
    pub fn snapshot(&self) -> GridSnapshot {
        let filled_levels = self.levels.iter().filter(|l| l.holding).count();
        let pending_buys = self
            .levels
            .iter()
            .filter(|l| l.buy_order_id.is_some())
            .count();
        let pending_sells = self
            .levels
            .iter()
            .filter(|l| l.sell_order_id.is_some())
            .count();

        GridSnapshot {
            symbol: self.params.symbol.to_string(),
            status: self.status,
            current_price: self.current_price.map(|p| decimal_to_f64(p.inner())),
            lower_price: decimal_to_f64(self.params.lower_price.inner()),
            upper_price: decimal_to_f64(self.params.upper_price.inner()),
            grid_count: self.params.grid_count,
            filled_levels,
            pending_buys,
            pending_sells,
            total_buys: self.total_buys,
            total_sells: self.total_sells,
            realized_pnl: decimal_to_f64(self.realized_pnl),
            stop_loss_tripped: self.stop_loss_tripped,
            last_update: chrono::DateTime::from_timestamp_millis(self.last_tick_ms)
                .unwrap_or_default()
                .to_rfc3339(),
        }
    }
}

/// Read-only grid view for the HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridSnapshot {
    pub symbol: String,
    pub status: GridStatus,
    pub current_price: Option<f64>,
    pub lower_price: f64,
    pub upper_price: f64,
    pub grid_count: u32,
    pub filled_levels: usize,
    pub pending_buys: usize,
    pub pending_sells: usize,
    pub total_buys: u64,
    pub total_sells: u64,
    pub realized_pnl: f64,
    pub stop_loss_tripped: bool,
    pub last_update: String,
}

fn decimal_to_f64(d: Decimal) -> f64 {
    d.to_string().parse().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::default_deployments;

    fn btc_state() -> GridState {
        let params = default_deployments().remove(0);
        GridState::new(params)
    }

    #[test]
    fn test_new_state_stopped_and_empty() {
        let state = btc_state();
        assert_eq!(state.status, GridStatus::Stopped);
        assert!(state.levels.is_empty());
        assert_eq!(state.epoch, 0);
    }

    #[test]
    fn test_build_levels_count_and_order() {
        let mut state = btc_state();
        state.build_levels();

        assert_eq!(state.levels.len(), 12);
        for pair in state.levels.windows(2) {
            assert!(pair[0].price < pair[1].price);
        }
        assert!(state.levels[0].price > state.params.lower_price);
        assert!(state.levels[11].price < state.params.upper_price);
    }

    #[test]
    fn test_snapshot_counts() {
        let mut state = btc_state();
        state.build_levels();
        state.levels[0].buy_order_id = Some("a".to_string());
        state.levels[1].buy_order_id = Some("b".to_string());
        state.levels[2].holding = true;
        state.levels[2].sell_order_id = Some("c".to_string());

        let snap = state.snapshot();
        assert_eq!(snap.pending_buys, 2);
        assert_eq!(snap.pending_sells, 1);
        assert_eq!(snap.filled_levels, 1);
        assert_eq!(snap.grid_count, 12);
        assert_eq!(snap.status, GridStatus::Stopped);
    }
}

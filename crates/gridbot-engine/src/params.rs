//! Grid parameters.

use gridbot_core::{Price, Qty, Symbol};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Immutable per-deployment grid configuration.
///
/// Level prices are center-aligned: level `i` sits at
/// `lower + (i + 0.5) * spacing`, so the grid never places exactly on
/// its own boundaries and the layout is deterministic for a given
/// parameter set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridParameters {
    pub symbol: Symbol,
    pub lower_price: Price,
    pub upper_price: Price,
    pub grid_count: u32,
    /// Total quote-currency investment spread across buy levels.
    pub total_investment: Decimal,
    #[serde(default)]
    pub stop_loss: Option<Price>,
    #[serde(default)]
    pub take_profit: Option<Price>,
    #[serde(default)]
    pub btc_filter_enabled: bool,
    /// Taker+maker fee in basis points, subtracted from each matched
    /// cycle's profit. Zero when unset.
    #[serde(default)]
    pub fee_bps: Decimal,
    /// Exchange price tick; zero disables price rounding.
    #[serde(default)]
    pub tick_size: Price,
    /// Exchange lot step; zero disables quantity rounding.
    #[serde(default)]
    pub lot_step: Qty,
}

impl GridParameters {
    /// Validate the parameter invariants.
    pub fn validate(&self) -> EngineResult<()> {
        if !self.lower_price.is_positive() {
            return Err(EngineError::InvalidParameters(format!(
                "lower_price must be positive, got {}",
                self.lower_price
            )));
        }
        if self.upper_price <= self.lower_price {
            return Err(EngineError::InvalidParameters(format!(
                "upper_price {} must be above lower_price {}",
                self.upper_price, self.lower_price
            )));
        }
        if self.grid_count < 2 {
            return Err(EngineError::InvalidParameters(format!(
                "grid_count must be at least 2, got {}",
                self.grid_count
            )));
        }
        if self.total_investment <= Decimal::ZERO {
            return Err(EngineError::InvalidParameters(format!(
                "total_investment must be positive, got {}",
                self.total_investment
            )));
        }
        if let Some(stop_loss) = self.stop_loss {
            if stop_loss >= self.lower_price {
                return Err(EngineError::InvalidParameters(format!(
                    "stop_loss {stop_loss} must be below lower_price {}",
                    self.lower_price
                )));
            }
        }
        if let Some(take_profit) = self.take_profit {
            if take_profit <= self.upper_price {
                return Err(EngineError::InvalidParameters(format!(
                    "take_profit {take_profit} must be above upper_price {}",
                    self.upper_price
                )));
            }
        }
        if self.fee_bps.is_sign_negative() {
            return Err(EngineError::InvalidParameters(format!(
                "fee_bps must not be negative, got {}",
                self.fee_bps
            )));
        }
        Ok(())
    }

    /// Distance between adjacent levels.
    pub fn spacing(&self) -> Price {
        (self.upper_price - self.lower_price) / Decimal::from(self.grid_count)
    }

    /// Quote investment per level.
    pub fn invest_per_level(&self) -> Decimal {
        self.total_investment / Decimal::from(self.grid_count)
    }

    /// Center-aligned price of level `index`, rounded to the tick.
    pub fn level_price(&self, index: u32) -> Price {
        let spacing = self.spacing();
        let offset = (Decimal::from(index) + Decimal::new(5, 1)) * spacing.inner();
        Price::new(self.lower_price.inner() + offset).round_to_tick(self.tick_size)
    }

    /// Quantity bought/sold at level `index`, rounded down to the lot
    /// step. Rounding happens once here; the matched sell reuses the
    /// same quantity so the cycle is symmetric.
    pub fn level_qty(&self, index: u32) -> Qty {
        let price = self.level_price(index);
        if price.is_zero() {
            return Qty::ZERO;
        }
        Qty::new(self.invest_per_level() / price.inner()).round_to_lot(self.lot_step)
    }

    /// Index of the level band containing `price`, clamped to the grid.
    pub fn band_index(&self, price: Price) -> u32 {
        let spacing = self.spacing();
        if spacing.is_zero() {
            return 0;
        }
        let raw = (price.inner() - self.lower_price.inner()) / spacing.inner();
        let floored = raw.floor();
        if floored.is_sign_negative() {
            0
        } else {
            let idx = floored.to_u32().unwrap_or(self.grid_count - 1);
            idx.min(self.grid_count - 1)
        }
    }
}

/// Built-in deployments, used when the config file names none.
pub fn default_deployments() -> Vec<GridParameters> {
    fn p(s: &str) -> Price {
        Price::new(s.parse().expect("const decimal"))
    }
    fn d(s: &str) -> Decimal {
        s.parse().expect("const decimal")
    }

    vec![
        GridParameters {
            symbol: Symbol::new("BTCUSDT"),
            lower_price: p("95500"),
            upper_price: p("99000"),
            grid_count: 12,
            total_investment: d("25000"),
            stop_loss: Some(p("94800")),
            take_profit: None,
            btc_filter_enabled: false,
            fee_bps: Decimal::ZERO,
            tick_size: Price::ZERO,
            lot_step: Qty::ZERO,
        },
        GridParameters {
            symbol: Symbol::new("MNTUSDT"),
            lower_price: p("1.04"),
            upper_price: p("1.12"),
            grid_count: 15,
            total_investment: d("6000"),
            stop_loss: Some(p("1.015")),
            take_profit: None,
            btc_filter_enabled: false,
            fee_bps: Decimal::ZERO,
            tick_size: Price::ZERO,
            lot_step: Qty::ZERO,
        },
        GridParameters {
            symbol: Symbol::new("DOGEUSDT"),
            lower_price: p("0.129"),
            upper_price: p("0.145"),
            grid_count: 18,
            total_investment: d("1500"),
            stop_loss: Some(p("0.120")),
            take_profit: None,
            btc_filter_enabled: false,
            fee_bps: Decimal::ZERO,
            tick_size: Price::ZERO,
            lot_step: Qty::ZERO,
        },
        GridParameters {
            symbol: Symbol::new("PEPEUSDT"),
            lower_price: p("0.00000416"),
            upper_price: p("0.00000479"),
            grid_count: 24,
            total_investment: d("1500"),
            stop_loss: Some(p("0.00000395")),
            take_profit: None,
            btc_filter_enabled: true,
            fee_bps: Decimal::ZERO,
            tick_size: Price::ZERO,
            lot_step: Qty::ZERO,
        },
    ]
}

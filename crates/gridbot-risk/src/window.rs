//! Rolling per-symbol price window.
//!
//! Bounded ring of recent prices with timestamps. Volatility is the
//! maximum relative deviation from the mean over the most recent
//! samples, in percent.

use std::collections::VecDeque;

use gridbot_core::Price;
use rust_decimal::Decimal;

/// Bounded ring of `(price, ts_ms)` samples.
#[derive(Debug)]
pub struct PriceWindow {
    samples: VecDeque<(Price, i64)>,
    capacity: usize,
    /// How many of the newest samples enter the volatility estimate.
    vol_samples: usize,
}

impl PriceWindow {
    pub fn new(capacity: usize, vol_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            vol_samples,
        }
    }

    /// Append a sample, evicting the oldest beyond capacity.
    pub fn push(&mut self, price: Price, ts_ms: i64) {
        self.samples.push_back((price, ts_ms));
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Latest sample, if any.
    pub fn last(&self) -> Option<(Price, i64)> {
        self.samples.back().copied()
    }

    /// Maximum relative deviation from the window mean, in percent,
    /// over the newest `vol_samples` entries.
    ///
    /// Returns `None` with fewer than `vol_samples` entries: a thin
    /// window says nothing about volatility yet.
    pub fn volatility_pct(&self) -> Option<Decimal> {
        if self.samples.len() < self.vol_samples {
            return None;
        }

        let recent: Vec<Decimal> = self
            .samples
            .iter()
            .rev()
            .take(self.vol_samples)
            .map(|(p, _)| p.inner())
            .collect();

        let mean = recent.iter().copied().sum::<Decimal>() / Decimal::from(recent.len() as u64);
        if mean.is_zero() {
            return None;
        }

        let hundred = Decimal::from(100);
        recent
            .iter()
            .map(|p| (*p - mean).abs() / mean * hundred)
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn window_with(prices: &[Decimal]) -> PriceWindow {
        let mut w = PriceWindow::new(100, 10);
        for (i, p) in prices.iter().enumerate() {
            w.push(Price::new(*p), i as i64 * 1000);
        }
        w
    }

    #[test]
    fn test_too_few_samples_no_estimate() {
        let w = window_with(&[dec!(100); 9]);
        assert!(w.volatility_pct().is_none());
    }

    #[test]
    fn test_flat_prices_zero_volatility() {
        let w = window_with(&[dec!(100); 10]);
        assert_eq!(w.volatility_pct().unwrap(), dec!(0));
    }

    #[test]
    fn test_deviation_above_threshold() {
        // Nine at 100, one at 110: mean = 101, max deviation = 9/101 ≈ 8.9%
        let mut prices = vec![dec!(100); 9];
        prices.push(dec!(110));
        let w = window_with(&prices);

        let vol = w.volatility_pct().unwrap();
        assert!(vol > dec!(8.5) && vol < dec!(9.5), "vol = {vol}");
    }

    #[test]
    fn test_only_recent_samples_count() {
        // Old spike outside the 10-sample estimate horizon
        let mut prices = vec![dec!(200)];
        prices.extend(std::iter::repeat(dec!(100)).take(10));
        let w = window_with(&prices);

        assert_eq!(w.volatility_pct().unwrap(), dec!(0));
    }

    #[test]
    fn test_capacity_eviction() {
        let mut w = PriceWindow::new(5, 3);
        for i in 0..10 {
            w.push(Price::new(Decimal::from(i)), i64::from(i) * 1000);
        }
        assert_eq!(w.len(), 5);
        assert_eq!(w.last().unwrap().0.inner(), dec!(9));
    }
}

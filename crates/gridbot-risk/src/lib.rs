//! Risk supervision for the grid trading bot.
//!
//! - `KillLatch`: a latch that, once triggered, stays triggered until an
//!   operator resets it. No automatic reset, ever.
//! - `RiskSupervisor`: rolling per-symbol volatility, API error budget,
//!   equity drawdown, the pre-trade gate, and the kill-condition
//!   evaluation that feeds the latch.

pub mod error;
pub mod latch;
pub mod supervisor;
pub mod window;

pub use error::{RiskError, RiskResult};
pub use latch::KillLatch;
pub use supervisor::{
    run_equity_poller, GateDecision, RiskConfig, RiskSnapshot, RiskSupervisor, StartCheck,
    BTC_SYMBOL,
};
pub use window::PriceWindow;

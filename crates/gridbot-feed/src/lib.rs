//! Price feed for the grid trading bot.
//!
//! One task pulls ticks from the exchange stream (REST polling when the
//! stream is unavailable) and fans them out to per-symbol subscribers
//! (grid workers) and firehose subscribers (risk supervisor). Ticks per
//! symbol are delivered in monotonic timestamp order; late ticks are
//! dropped at this boundary so no consumer needs its own guard.

pub mod error;
pub mod feed;

pub use error::{FeedError, FeedResult};
pub use feed::{run_feed, FeedHandle, PriceFeed};

//! Exchange capability for the grid trading bot.
//!
//! The core consumes the [`Exchange`] trait and never sees transport
//! details. Three implementations live here:
//! - [`BybitExchange`]: Bybit v5 spot REST + public ticker stream
//! - [`MockExchange`]: deterministic in-memory exchange for tests and
//!   keyless operation
//! - [`MeteredExchange`]: wrapper adding the global rate limit, the
//!   per-call deadline, and error-rate reporting

pub mod bybit;
pub mod client;
pub mod error;
pub mod metered;
pub mod mock;
pub mod rate_limiter;
pub mod signing;

pub use bybit::{BybitCredentials, BybitExchange};
pub use client::{CallObserver, DynExchange, Exchange, NullObserver, PlacedOrder};
pub use error::{ExchangeError, ExchangeResult};
pub use metered::{MeteredExchange, DEFAULT_CALL_DEADLINE};
pub use mock::{mock_with_default_prices, MockExchange};
pub use rate_limiter::RateLimiter;
pub use signing::RequestSigner;

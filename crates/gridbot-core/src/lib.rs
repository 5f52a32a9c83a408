//! Core domain types for the grid trading bot.
//!
//! This crate provides the fundamental types used throughout the system:
//! - `Symbol`: Normalized trading pair identifier
//! - `Price`, `Qty`: Precision-safe decimal types
//! - `OrderSide`, `OrderState`, `TimeInForce`: Trading enums
//! - `ClientOrderId`: Idempotency tag for order placement

pub mod decimal;
pub mod error;
pub mod order;
pub mod symbol;
pub mod tick;

pub use decimal::{Price, Qty};
pub use error::{CoreError, CoreResult};
pub use order::{ClientOrderId, OpenOrder, OrderSide, OrderState, OrderStatus, TimeInForce};
pub use symbol::Symbol;
pub use tick::PriceTick;

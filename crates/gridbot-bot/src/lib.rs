//! Application wiring for the grid trading bot binary.

pub mod app;
pub mod config;
pub mod error;
pub mod logging;

pub use app::Application;
pub use config::{AppConfig, PersistenceConfig, RateLimitConfig, ServerConfig};
pub use error::{AppError, AppResult};
pub use logging::init_logging;

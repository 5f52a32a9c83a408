//! Error types for gridbot-feed.

use thiserror::Error;

/// Feed errors.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Exchange error: {0}")]
    Exchange(#[from] gridbot_exchange::ExchangeError),

    #[error("Feed stopped: {0}")]
    Stopped(String),
}

/// Result type alias for feed operations.
pub type FeedResult<T> = std::result::Result<T, FeedError>;

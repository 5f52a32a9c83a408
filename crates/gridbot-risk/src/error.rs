//! Error types for gridbot-risk.

use thiserror::Error;

/// Risk subsystem errors.
#[derive(Debug, Error)]
pub enum RiskError {
    /// `reset_kill` refused because a kill condition still holds.
    #[error("Kill condition still active: {0}")]
    ConditionStillActive(String),

    /// The kill latch is set; the requested operation is forbidden.
    #[error("Kill switch triggered: {0}")]
    Killed(String),
}

/// Result type alias for risk operations.
pub type RiskResult<T> = std::result::Result<T, RiskError>;

//! Error types for gridbot-engine.

use gridbot_core::Symbol;
use thiserror::Error;

/// Engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Sticky per-symbol stop-loss flag; cleared only by an explicit stop.
    #[error("Stop-loss tripped for {0}")]
    StopLossTripped(Symbol),

    /// The global kill latch is set.
    #[error("Killed by risk: {0}")]
    KilledByRisk(String),

    /// Pre-trade gate or state machine refused the operation.
    #[error("{0}")]
    Blocked(String),

    /// Exchange unreachable after retries.
    #[error("Exchange unavailable: {0}")]
    ExchangeUnavailable(String),

    #[error("Invalid grid parameters: {0}")]
    InvalidParameters(String),

    #[error("Unknown symbol: {0}")]
    UnknownSymbol(Symbol),

    /// Worker task is gone (undeployed or crashed).
    #[error("Worker for {0} is not running")]
    WorkerGone(Symbol),

    #[error(transparent)]
    Exchange(#[from] gridbot_exchange::ExchangeError),
}

impl EngineError {
    /// Machine-readable code for the HTTP surface.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::StopLossTripped(_) => "stop_loss_tripped",
            Self::KilledByRisk(_) => "killed_by_risk",
            Self::Blocked(_) => "blocked",
            Self::ExchangeUnavailable(_) => "exchange_unavailable",
            Self::InvalidParameters(_) => "invalid_parameters",
            Self::UnknownSymbol(_) => "unknown_symbol",
            Self::WorkerGone(_) => "worker_gone",
            Self::Exchange(e) => e.code(),
        }
    }
}

/// Result type alias for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

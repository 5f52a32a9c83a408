//! Exchange error classification.
//!
//! Every transport failure is mapped into one of five kinds before it
//! reaches the core. Workers recover `Transient` and `RateLimited`
//! locally with backoff; `Auth` escalates to the controller; `Invalid`
//! and `Terminal` fault the operation that caused them.

use thiserror::Error;

/// Classified exchange errors.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Network failure, 5xx, or timeout. Retryable with backoff.
    #[error("Transient exchange error: {0}")]
    Transient(String),

    /// Provider rate limit hit. Retryable after waiting.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Signature or API-key failure. Never retried; escalated.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The request itself is wrong: unknown symbol, bad quantity,
    /// insufficient balance. Never retried.
    #[error("Invalid request: {0}")]
    Invalid(String),

    /// Unrecoverable provider-side condition.
    #[error("Terminal exchange error: {0}")]
    Terminal(String),
}

impl ExchangeError {
    /// Whether a retry with backoff may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited(_))
    }

    /// Whether the controller should be notified immediately.
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Short machine-readable code for snapshots and logs.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transient(_) => "exchange_transient",
            Self::RateLimited(_) => "exchange_rate_limited",
            Self::Auth(_) => "exchange_auth",
            Self::Invalid(_) => "exchange_invalid",
            Self::Terminal(_) => "exchange_terminal",
        }
    }

    /// Classify a Bybit v5 retCode into an error kind.
    ///
    /// Codes from the v5 API docs: 10002 (request expired), 10006/10018
    /// (rate limit), 10003/10004/10005 (key/signature/permission),
    /// 110001 (order not found), 170131 (insufficient balance),
    /// 170121 (invalid symbol).
    pub fn from_ret_code(ret_code: i64, ret_msg: &str) -> Self {
        match ret_code {
            10006 | 10018 => Self::RateLimited(format!("retCode {ret_code}: {ret_msg}")),
            10003 | 10004 | 10005 => Self::Auth(format!("retCode {ret_code}: {ret_msg}")),
            10002 => Self::Transient(format!("retCode {ret_code}: {ret_msg}")),
            170121 | 170131 | 110001 => Self::Invalid(format!("retCode {ret_code}: {ret_msg}")),
            _ => Self::Terminal(format!("retCode {ret_code}: {ret_msg}")),
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            Self::Transient(e.to_string())
        } else if e.status().map(|s| s.is_server_error()).unwrap_or(false) {
            Self::Transient(e.to_string())
        } else if e.status().map(|s| s.as_u16() == 429).unwrap_or(false) {
            Self::RateLimited(e.to_string())
        } else {
            Self::Terminal(e.to_string())
        }
    }
}

/// Result type alias for exchange operations.
pub type ExchangeResult<T> = std::result::Result<T, ExchangeError>;

//! Trading pair identifier.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Normalized spot trading pair, e.g. `BTCUSDT`.
///
/// Always stored upper-case. Webhook sources may send a bare base asset
/// (`"btc"`); `normalize` appends the USDT quote when missing so the rest
/// of the system only ever sees full pairs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into().to_uppercase())
    }

    /// Normalize an external symbol: upper-case and append `USDT`
    /// when no known quote suffix is present.
    pub fn normalize(s: &str) -> Self {
        let upper = s.trim().to_uppercase();
        if upper.ends_with("USDT") {
            Self(upper)
        } else {
            Self(format!("{upper}USDT"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl AsRef<str> for Symbol {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

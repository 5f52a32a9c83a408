//! Webhook alert validation and routing.
//!
//! Alerts arrive as JSON with an `X-Webhook-Signature` header holding
//! the lowercase hex HMAC-SHA256 of the exact body bytes under the
//! shared secret. Validation is timing-safe. Accepted alerts map onto
//! grid operations: buy/long resumes, sell/short pauses, close stops.

use std::collections::HashMap;
use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{info, warn};

use gridbot_core::{Price, Symbol};

type HmacSha256 = Hmac<Sha256>;

/// Retained alert history entries.
const HISTORY_CAPACITY: usize = 500;

/// Maximum age before an alert is considered stale.
const MAX_ALERT_AGE_SECS: i64 = 60;

/// Maximum deviation between the alert price and the live price, in
/// percent, before the alert is refused.
const MAX_PRICE_DEVIATION_PCT: f64 = 1.0;

/// Incoming webhook payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertPayload {
    pub symbol: String,
    pub action: String,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub zone: Option<String>,
}

/// Grid operation an alert maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GridAction {
    Resume,
    Pause,
    Stop,
}

impl GridAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resume => "resume",
            Self::Pause => "pause",
            Self::Stop => "stop",
        }
    }
}

/// A parsed, validated alert ready for execution.
#[derive(Debug, Clone)]
pub struct AlertOutcome {
    pub symbol: Symbol,
    pub action: GridAction,
    pub price: Option<f64>,
    pub zone: String,
    pub received_at: DateTime<Utc>,
}

/// One history entry.
#[derive(Debug, Clone, Serialize)]
pub struct AlertRecord {
    pub symbol: String,
    pub action: String,
    pub price: Option<f64>,
    pub zone: String,
    pub timestamp: String,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Aggregate history statistics.
#[derive(Debug, Clone, Serialize)]
pub struct AlertStats {
    pub total: usize,
    pub by_symbol: HashMap<String, usize>,
    pub by_action: HashMap<String, usize>,
    pub last_alert: Option<String>,
}

/// Validates, parses, and records webhook alerts.
pub struct AlertRouter {
    /// Shared secret; `None` disables signature checking (dev only).
    secret: Option<String>,
    history: Mutex<VecDeque<AlertRecord>>,
}

impl AlertRouter {
    pub fn new(secret: Option<String>) -> Self {
        if secret.is_none() {
            warn!("Webhook secret not configured, signature checks disabled");
        }
        Self {
            secret,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
        }
    }

    /// Timing-safe signature check over the exact received bytes.
    ///
    /// `signature` is lowercase hex HMAC-SHA256. Returns true when no
    /// secret is configured.
    pub fn validate_signature(&self, body: &[u8], signature: &str) -> bool {
        let Some(secret) = &self.secret else {
            return true;
        };
        let Ok(expected) = hex::decode(signature.trim()) else {
            return false;
        };

        let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return false,
        };
        mac.update(body);
        // verify_slice is constant-time
        mac.verify_slice(&expected).is_ok()
    }

    /// Parse a payload into an executable alert.
    ///
    /// Normalizes the symbol (upper-case, `USDT` suffix) and maps the
    /// action. Unknown actions are rejected and recorded.
    pub fn parse(&self, payload: &AlertPayload) -> Result<AlertOutcome, String> {
        let symbol = Symbol::normalize(&payload.symbol);
        if payload.symbol.trim().is_empty() {
            let reason = "Empty symbol".to_string();
            self.record_rejected(payload, &reason);
            return Err(reason);
        }

        let action = match payload.action.to_lowercase().as_str() {
            "buy" | "long" => GridAction::Resume,
            "sell" | "short" => GridAction::Pause,
            "close" => GridAction::Stop,
            other => {
                let reason = format!("Unknown action: {other}");
                self.record_rejected(payload, &reason);
                return Err(reason);
            }
        };

        Ok(AlertOutcome {
            symbol,
            action,
            price: payload.price.filter(|p| *p > 0.0),
            zone: payload.zone.clone().unwrap_or_else(|| "unknown".to_string()),
            received_at: Utc::now(),
        })
    }

    /// Execution guard: refuse stale alerts and alerts whose price is
    /// too far from the live market.
    pub fn should_execute(&self, alert: &AlertOutcome, current_price: Option<Price>) -> Result<(), String> {
        let age_secs = (Utc::now() - alert.received_at).num_seconds();
        if age_secs > MAX_ALERT_AGE_SECS {
            return Err(format!("Alert too old: {age_secs}s"));
        }

        if let (Some(alert_price), Some(live)) = (alert.price, current_price) {
            let live: f64 = live.inner().to_string().parse().unwrap_or(0.0);
            if live > 0.0 {
                let deviation = ((live - alert_price).abs() / live) * 100.0;
                if deviation > MAX_PRICE_DEVIATION_PCT {
                    return Err(format!("Price deviation too high: {deviation:.2}%"));
                }
            }
        }

        Ok(())
    }

    /// Record an executed (or refused) alert.
    pub fn record(&self, alert: &AlertOutcome, accepted: bool, detail: Option<String>) {
        let record = AlertRecord {
            symbol: alert.symbol.to_string(),
            action: alert.action.as_str().to_string(),
            price: alert.price,
            zone: alert.zone.clone(),
            timestamp: alert.received_at.to_rfc3339(),
            accepted,
            detail,
        };
        info!(symbol = %record.symbol, action = %record.action, accepted, "Alert recorded");
        self.push(record);
    }

    fn record_rejected(&self, payload: &AlertPayload, reason: &str) {
        self.push(AlertRecord {
            symbol: payload.symbol.to_uppercase(),
            action: payload.action.clone(),
            price: payload.price,
            zone: payload.zone.clone().unwrap_or_else(|| "unknown".to_string()),
            timestamp: Utc::now().to_rfc3339(),
            accepted: false,
            detail: Some(reason.to_string()),
        });
    }

    fn push(&self, record: AlertRecord) {
        let mut history = self.history.lock();
        history.push_back(record);
        while history.len() > HISTORY_CAPACITY {
            history.pop_front();
        }
    }

    /// Newest-first history, optionally filtered by symbol.
    pub fn recent(&self, symbol: Option<&str>, limit: usize) -> Vec<AlertRecord> {
        let history = self.history.lock();
        history
            .iter()
            .rev()
            .filter(|r| symbol.map(|s| r.symbol.eq_ignore_ascii_case(s)).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Aggregate statistics over the retained history.
    pub fn stats(&self) -> AlertStats {
        let history = self.history.lock();
        let mut by_symbol: HashMap<String, usize> = HashMap::new();
        let mut by_action: HashMap<String, usize> = HashMap::new();
        for record in history.iter() {
            *by_symbol.entry(record.symbol.clone()).or_default() += 1;
            *by_action.entry(record.action.clone()).or_default() += 1;
        }
        AlertStats {
            total: history.len(),
            by_symbol,
            by_action,
            last_alert: history.back().map(|r| r.timestamp.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn signed_router() -> AlertRouter {
        AlertRouter::new(Some("test-secret".to_string()))
    }

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    fn payload(symbol: &str, action: &str) -> AlertPayload {
        AlertPayload {
            symbol: symbol.to_string(),
            action: action.to_string(),
            price: Some(97250.0),
            zone: None,
        }
    }

    #[test]
    fn test_valid_signature_accepted() {
        let router = signed_router();
        let body = br#"{"symbol":"BTCUSDT","action":"buy","price":97250}"#;
        let signature = sign("test-secret", body);
        assert!(router.validate_signature(body, &signature));
    }

    #[test]
    fn test_wrong_signature_rejected() {
        let router = signed_router();
        let body = br#"{"symbol":"BTCUSDT","action":"buy","price":97250}"#;
        let signature = sign("other-secret", body);
        assert!(!router.validate_signature(body, &signature));
    }

    #[test]
    fn test_tampered_body_rejected() {
        let router = signed_router();
        let body = br#"{"symbol":"BTCUSDT","action":"buy","price":97250}"#;
        let signature = sign("test-secret", body);
        let tampered = br#"{"symbol":"BTCUSDT","action":"sell","price":97250}"#;
        assert!(!router.validate_signature(tampered, &signature));
    }

    #[test]
    fn test_malformed_hex_rejected() {
        let router = signed_router();
        assert!(!router.validate_signature(b"{}", "not-hex!"));
        assert!(!router.validate_signature(b"{}", ""));
    }

    #[test]
    fn test_no_secret_accepts_anything() {
        let router = AlertRouter::new(None);
        assert!(router.validate_signature(b"{}", "whatever"));
    }

    #[test]
    fn test_action_mapping() {
        let router = AlertRouter::new(None);
        assert_eq!(router.parse(&payload("BTCUSDT", "buy")).unwrap().action, GridAction::Resume);
        assert_eq!(router.parse(&payload("BTCUSDT", "LONG")).unwrap().action, GridAction::Resume);
        assert_eq!(router.parse(&payload("BTCUSDT", "sell")).unwrap().action, GridAction::Pause);
        assert_eq!(router.parse(&payload("BTCUSDT", "short")).unwrap().action, GridAction::Pause);
        assert_eq!(router.parse(&payload("BTCUSDT", "close")).unwrap().action, GridAction::Stop);
        assert!(router.parse(&payload("BTCUSDT", "hodl")).is_err());
    }

    #[test]
    fn test_symbol_normalization() {
        let router = AlertRouter::new(None);
        let alert = router.parse(&payload("btc", "buy")).unwrap();
        assert_eq!(alert.symbol.as_str(), "BTCUSDT");
    }

    #[test]
    fn test_price_deviation_guard() {
        let router = AlertRouter::new(None);
        let alert = router.parse(&payload("BTCUSDT", "buy")).unwrap();

        // Live price within 1% of 97250
        assert!(router
            .should_execute(&alert, Some(Price::new(dec!(97500))))
            .is_ok());
        // Live price 3% away
        let err = router
            .should_execute(&alert, Some(Price::new(dec!(94000))))
            .unwrap_err();
        assert!(err.contains("deviation"));
        // No live price known: nothing to compare against
        assert!(router.should_execute(&alert, None).is_ok());
    }

    #[test]
    fn test_history_ring_and_stats() {
        let router = AlertRouter::new(None);
        for i in 0..510 {
            let alert = router
                .parse(&payload(if i % 2 == 0 { "BTCUSDT" } else { "DOGEUSDT" }, "buy"))
                .unwrap();
            router.record(&alert, true, None);
        }

        let stats = router.stats();
        assert_eq!(stats.total, 500);
        assert!(stats.last_alert.is_some());
        assert_eq!(stats.by_action.get("resume"), Some(&500));

        let recent = router.recent(Some("BTCUSDT"), 10);
        assert_eq!(recent.len(), 10);
        assert!(recent.iter().all(|r| r.symbol == "BTCUSDT"));
    }

    #[test]
    fn test_rejected_alerts_recorded() {
        let router = AlertRouter::new(None);
        let _ = router.parse(&payload("BTCUSDT", "hodl"));

        let stats = router.stats();
        assert_eq!(stats.total, 1);
        let recent = router.recent(None, 10);
        assert!(!recent[0].accepted);
    }
}

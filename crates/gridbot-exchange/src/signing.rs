//! Bybit v5 request signing.
//!
//! Signature scheme: HMAC-SHA256 over
//! `{timestamp}{api_key}{recv_window}{payload}` where payload is the
//! query string for GET and the JSON body for POST. The hex digest goes
//! into the `X-BAPI-SIGN` header.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{ExchangeError, ExchangeResult};

type HmacSha256 = Hmac<Sha256>;

/// Receive window sent with every signed request, in milliseconds.
pub const RECV_WINDOW_MS: &str = "5000";

/// Signs Bybit v5 requests with account credentials.
#[derive(Clone)]
pub struct RequestSigner {
    api_key: String,
    api_secret: String,
}

impl RequestSigner {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Build the message to sign for a request.
    fn build_message(&self, timestamp_ms: i64, payload: &str) -> String {
        format!("{timestamp_ms}{}{RECV_WINDOW_MS}{payload}", self.api_key)
    }

    /// Produce the lowercase hex HMAC-SHA256 signature.
    pub fn sign(&self, timestamp_ms: i64, payload: &str) -> ExchangeResult<String> {
        let message = self.build_message(timestamp_ms, payload);

        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| ExchangeError::Auth(format!("HMAC init failed: {e}")))?;
        mac.update(message.as_bytes());

        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Signed header set for a request carrying `payload`.
    pub fn headers(&self, timestamp_ms: i64, payload: &str) -> ExchangeResult<Vec<(String, String)>> {
        let signature = self.sign(timestamp_ms, payload)?;
        Ok(vec![
            ("X-BAPI-API-KEY".to_string(), self.api_key.clone()),
            ("X-BAPI-SIGN".to_string(), signature),
            ("X-BAPI-TIMESTAMP".to_string(), timestamp_ms.to_string()),
            ("X-BAPI-RECV-WINDOW".to_string(), RECV_WINDOW_MS.to_string()),
        ])
    }
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Secrets never reach logs
        f.debug_struct("RequestSigner")
            .field("api_key", &"<redacted>")
            .finish()
    }
}

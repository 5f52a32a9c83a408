//! Bybit v5 spot exchange implementation.
//!
//! REST for account operations, public WebSocket for the ticker stream.
//! Everything returned to the core goes through typed records; raw JSON
//! never crosses the crate boundary.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use gridbot_core::{
    ClientOrderId, OpenOrder, OrderSide, OrderState, OrderStatus, Price, PriceTick, Qty, Symbol,
};

use crate::client::{Exchange, PlacedOrder};
use crate::error::{ExchangeError, ExchangeResult};
use crate::signing::RequestSigner;

const MAINNET_REST: &str = "https://api.bybit.com";
const TESTNET_REST: &str = "https://api-testnet.bybit.com";
const MAINNET_WS: &str = "wss://stream.bybit.com/v5/public/spot";
const TESTNET_WS: &str = "wss://stream-testnet.bybit.com/v5/public/spot";

/// Default timeout for REST requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the tick channel handed to the feed.
const TICK_CHANNEL_CAPACITY: usize = 1024;

/// Account credentials.
#[derive(Clone)]
pub struct BybitCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub testnet: bool,
}

impl BybitCredentials {
    /// Load credentials from the environment.
    ///
    /// Returns `None` when no API key is configured, which the caller
    /// uses to select the mock exchange instead.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("BYBIT_API_KEY").ok()?;
        let api_secret = std::env::var("BYBIT_API_SECRET").unwrap_or_default();
        let testnet = std::env::var("BYBIT_TESTNET")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        Some(Self {
            api_key,
            api_secret,
            testnet,
        })
    }
}

impl std::fmt::Debug for BybitCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BybitCredentials")
            .field("testnet", &self.testnet)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Wire types
// ============================================================================

/// Bybit v5 response envelope.
#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg")]
    ret_msg: String,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TickerResult {
    list: Vec<TickerEntry>,
}

#[derive(Debug, Deserialize)]
struct TickerEntry {
    symbol: String,
    #[serde(rename = "lastPrice")]
    last_price: String,
}

#[derive(Debug, Deserialize)]
struct OrderCreateResult {
    #[serde(rename = "orderId")]
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct OrderListResult {
    list: Vec<OrderEntry>,
}

#[derive(Debug, Deserialize)]
struct OrderEntry {
    #[serde(rename = "orderId")]
    order_id: String,
    symbol: String,
    side: String,
    price: String,
    qty: String,
    #[serde(rename = "orderStatus")]
    order_status: String,
    #[serde(rename = "cumExecQty", default)]
    cum_exec_qty: String,
    #[serde(rename = "avgPrice", default)]
    avg_price: String,
}

#[derive(Debug, Deserialize)]
struct WalletResult {
    list: Vec<WalletAccount>,
}

#[derive(Debug, Deserialize)]
struct WalletAccount {
    #[serde(rename = "totalEquity", default)]
    total_equity: String,
}

fn parse_decimal_field(s: &str, field: &str) -> ExchangeResult<rust_decimal::Decimal> {
    if s.is_empty() {
        return Ok(rust_decimal::Decimal::ZERO);
    }
    s.parse()
        .map_err(|e| ExchangeError::Terminal(format!("Unparseable {field} {s:?}: {e}")))
}

fn parse_order_state(status: &str) -> OrderState {
    match status {
        "New" | "Untriggered" | "Created" => OrderState::New,
        "PartiallyFilled" => OrderState::Partial,
        "Filled" => OrderState::Filled,
        "Cancelled" | "PartiallyFilledCanceled" | "Deactivated" => OrderState::Cancelled,
        "Rejected" => OrderState::Rejected,
        other => {
            warn!(status = other, "Unknown Bybit order status, treating as NEW");
            OrderState::New
        }
    }
}

fn parse_order_entry(entry: &OrderEntry) -> ExchangeResult<OpenOrder> {
    let side = match entry.side.as_str() {
        "Buy" => OrderSide::Buy,
        "Sell" => OrderSide::Sell,
        other => {
            return Err(ExchangeError::Terminal(format!(
                "Unknown order side {other:?}"
            )))
        }
    };
    Ok(OpenOrder {
        order_id: entry.order_id.clone(),
        symbol: Symbol::new(entry.symbol.clone()),
        side,
        price: Price::new(parse_decimal_field(&entry.price, "price")?),
        qty: Qty::new(parse_decimal_field(&entry.qty, "qty")?),
    })
}

// ============================================================================
// Client
// ============================================================================

/// Bybit v5 spot client.
pub struct BybitExchange {
    http: Client,
    signer: RequestSigner,
    base_url: String,
    ws_url: String,
}

impl BybitExchange {
    pub fn new(credentials: BybitCredentials) -> ExchangeResult<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ExchangeError::Terminal(format!("HTTP client build failed: {e}")))?;

        let (base_url, ws_url) = if credentials.testnet {
            (TESTNET_REST.to_string(), TESTNET_WS.to_string())
        } else {
            (MAINNET_REST.to_string(), MAINNET_WS.to_string())
        };

        Ok(Self {
            http,
            signer: RequestSigner::new(credentials.api_key, credentials.api_secret),
            base_url,
            ws_url,
        })
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Signed GET. `query` must already be in canonical `k=v&k=v` order.
    async fn signed_get<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &str,
    ) -> ExchangeResult<T> {
        let ts = Self::now_ms();
        let url = format!("{}{endpoint}?{query}", self.base_url);
        let mut request = self.http.get(&url);
        for (name, value) in self.signer.headers(ts, query)? {
            request = request.header(name, value);
        }
        let response = request.send().await?;
        Self::unwrap_envelope(response).await
    }

    /// Signed POST with a JSON body.
    async fn signed_post<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        body: serde_json::Value,
    ) -> ExchangeResult<T> {
        let ts = Self::now_ms();
        let payload = body.to_string();
        let url = format!("{}{endpoint}", self.base_url);
        let mut request = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .body(payload.clone());
        for (name, value) in self.signer.headers(ts, &payload)? {
            request = request.header(name, value);
        }
        let response = request.send().await?;
        Self::unwrap_envelope(response).await
    }

    /// Unsigned GET for public market data.
    async fn public_get<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &str,
    ) -> ExchangeResult<T> {
        let url = format!("{}{endpoint}?{query}", self.base_url);
        let response = self.http.get(&url).send().await?;
        Self::unwrap_envelope(response).await
    }

    async fn unwrap_envelope<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> ExchangeResult<T> {
        let status = response.status();
        if status.is_server_error() {
            return Err(ExchangeError::Transient(format!("HTTP {status}")));
        }
        if status.as_u16() == 429 {
            return Err(ExchangeError::RateLimited(format!("HTTP {status}")));
        }

        let envelope: ApiEnvelope<T> = response
            .json()
            .await
            .map_err(|e| ExchangeError::Transient(format!("Malformed response: {e}")))?;

        if envelope.ret_code != 0 {
            return Err(ExchangeError::from_ret_code(
                envelope.ret_code,
                &envelope.ret_msg,
            ));
        }

        envelope
            .result
            .ok_or_else(|| ExchangeError::Terminal("Missing result in response".to_string()))
    }

    /// Query order status from the realtime endpoint, falling back to
    /// order history for orders that already left the book.
    async fn query_order(&self, symbol: &Symbol, order_id: &str) -> ExchangeResult<OrderEntry> {
        let query = format!("category=spot&orderId={order_id}&symbol={symbol}");

        let realtime: OrderListResult = self.signed_get("/v5/order/realtime", &query).await?;
        if let Some(entry) = realtime.list.into_iter().next() {
            return Ok(entry);
        }

        let history: OrderListResult = self.signed_get("/v5/order/history", &query).await?;
        history.list.into_iter().next().ok_or_else(|| {
            ExchangeError::Invalid(format!("Order {order_id} not found for {symbol}"))
        })
    }
}

#[async_trait]
impl Exchange for BybitExchange {
    async fn place_limit(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        price: Price,
        qty: Qty,
        client_tag: &ClientOrderId,
    ) -> ExchangeResult<PlacedOrder> {
        let body = json!({
            "category": "spot",
            "symbol": symbol.as_str(),
            "side": match side { OrderSide::Buy => "Buy", OrderSide::Sell => "Sell" },
            "orderType": "Limit",
            "qty": qty.to_string(),
            "price": price.to_string(),
            "timeInForce": "GTC",
            "orderLinkId": client_tag.as_str(),
        });

        let result: OrderCreateResult = self.signed_post("/v5/order/create", body).await?;
        debug!(%symbol, %side, %price, %qty, order_id = %result.order_id, "Order placed");
        Ok(PlacedOrder {
            order_id: result.order_id,
        })
    }

    async fn cancel(&self, symbol: &Symbol, order_id: &str) -> ExchangeResult<()> {
        let body = json!({
            "category": "spot",
            "symbol": symbol.as_str(),
            "orderId": order_id,
        });

        let result: ExchangeResult<OrderCreateResult> =
            self.signed_post("/v5/order/cancel", body).await;
        match result {
            Ok(_) => Ok(()),
            // Already gone counts as cancelled
            Err(ExchangeError::Invalid(msg)) => {
                debug!(order_id, %msg, "Cancel target not found, treating as success");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn order_status(&self, symbol: &Symbol, order_id: &str) -> ExchangeResult<OrderStatus> {
        let entry = self.query_order(symbol, order_id).await?;
        Ok(OrderStatus::new(
            parse_order_state(&entry.order_status),
            Qty::new(parse_decimal_field(&entry.cum_exec_qty, "cumExecQty")?),
            Price::new(parse_decimal_field(&entry.avg_price, "avgPrice")?),
        ))
    }

    async fn open_orders(&self, symbol: &Symbol) -> ExchangeResult<Vec<OpenOrder>> {
        let query = format!("category=spot&symbol={symbol}");
        let result: OrderListResult = self.signed_get("/v5/order/realtime", &query).await?;
        result.list.iter().map(parse_order_entry).collect()
    }

    async fn wallet_equity(&self) -> ExchangeResult<Price> {
        let result: WalletResult = self
            .signed_get("/v5/account/wallet-balance", "accountType=UNIFIED")
            .await?;
        let account = result
            .list
            .first()
            .ok_or_else(|| ExchangeError::Terminal("Empty wallet response".to_string()))?;
        Ok(Price::new(parse_decimal_field(
            &account.total_equity,
            "totalEquity",
        )?))
    }

    async fn ticker(&self, symbol: &Symbol) -> ExchangeResult<PriceTick> {
        let query = format!("category=spot&symbol={symbol}");
        let result: TickerResult = self.public_get("/v5/market/tickers", &query).await?;
        let entry = result
            .list
            .first()
            .ok_or_else(|| ExchangeError::Invalid(format!("No ticker for {symbol}")))?;
        Ok(PriceTick::new(
            Symbol::new(entry.symbol.clone()),
            Price::new(parse_decimal_field(&entry.last_price, "lastPrice")?),
            Self::now_ms(),
        ))
    }

    async fn subscribe(&self, symbols: &[Symbol]) -> ExchangeResult<mpsc::Receiver<PriceTick>> {
        let (tx, rx) = mpsc::channel(TICK_CHANNEL_CAPACITY);
        let ws_url = self.ws_url.clone();
        let topics: Vec<String> = symbols.iter().map(|s| format!("tickers.{s}")).collect();

        tokio::spawn(async move {
            if let Err(e) = run_ticker_stream(&ws_url, &topics, tx).await {
                error!(error = %e, "Ticker stream terminated");
            }
        });

        Ok(rx)
    }
}

/// Connect, subscribe, and forward ticker messages until the channel or
/// the socket closes.
async fn run_ticker_stream(
    ws_url: &str,
    topics: &[String],
    tx: mpsc::Sender<PriceTick>,
) -> ExchangeResult<()> {
    let (ws, _) = connect_async(ws_url)
        .await
        .map_err(|e| ExchangeError::Transient(format!("WS connect failed: {e}")))?;
    let (mut sink, mut stream) = ws.split();

    let subscribe = json!({ "op": "subscribe", "args": topics });
    sink.send(Message::Text(subscribe.to_string()))
        .await
        .map_err(|e| ExchangeError::Transient(format!("WS subscribe failed: {e}")))?;
    info!(?topics, "Subscribed to ticker stream");

    while let Some(message) = stream.next().await {
        let message =
            message.map_err(|e| ExchangeError::Transient(format!("WS receive failed: {e}")))?;
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
            continue;
        };
        let Some(topic) = value.get("topic").and_then(|t| t.as_str()) else {
            continue;
        };
        let Some(symbol) = topic.strip_prefix("tickers.") else {
            continue;
        };
        let Some(last_price) = value
            .pointer("/data/lastPrice")
            .and_then(|p| p.as_str())
            .and_then(|p| p.parse().ok())
        else {
            continue;
        };
        let ts_ms = value
            .get("ts")
            .and_then(|t| t.as_i64())
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

        let tick = PriceTick::new(Symbol::new(symbol), Price::new(last_price), ts_ms);
        if tx.send(tick).await.is_err() {
            // Receiver dropped: feed switched away or shut down
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_order_state() {
        assert_eq!(parse_order_state("New"), OrderState::New);
        assert_eq!(parse_order_state("PartiallyFilled"), OrderState::Partial);
        assert_eq!(parse_order_state("Filled"), OrderState::Filled);
        assert_eq!(parse_order_state("Cancelled"), OrderState::Cancelled);
        assert_eq!(
            parse_order_state("PartiallyFilledCanceled"),
            OrderState::Cancelled
        );
        assert_eq!(parse_order_state("Rejected"), OrderState::Rejected);
    }

    #[test]
    fn test_parse_order_entry() {
        let entry = OrderEntry {
            order_id: "1234".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: "Buy".to_string(),
            price: "97104.16".to_string(),
            qty: "0.0214".to_string(),
            order_status: "New".to_string(),
            cum_exec_qty: String::new(),
            avg_price: String::new(),
        };

        let order = parse_order_entry(&entry).unwrap();
        assert_eq!(order.order_id, "1234");
        assert_eq!(order.symbol.as_str(), "BTCUSDT");
        assert_eq!(order.side, OrderSide::Buy);
        assert_eq!(order.price.inner(), dec!(97104.16));
        assert_eq!(order.qty.inner(), dec!(0.0214));
    }

    #[test]
    fn test_parse_empty_decimal_field() {
        assert_eq!(
            parse_decimal_field("", "avgPrice").unwrap(),
            rust_decimal::Decimal::ZERO
        );
    }

    #[test]
    fn test_envelope_error_mapping() {
        let envelope: ApiEnvelope<TickerResult> = serde_json::from_str(
            r#"{"retCode": 10006, "retMsg": "Too many visits", "result": null}"#,
        )
        .unwrap();
        assert_eq!(envelope.ret_code, 10006);
        let err = ExchangeError::from_ret_code(envelope.ret_code, &envelope.ret_msg);
        assert!(matches!(err, ExchangeError::RateLimited(_)));
    }
}

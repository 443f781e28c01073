use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use super::{AccountSource, CandleSource, OrderSink};
use crate::error::{ConfigError, SinkError, SourceError};
use crate::models::{
    split_symbol, AccountState, Candle, MarketRules, OrderConfirmation, OrderIntent, Side,
};

pub const BINANCE_API_BASE: &str = "https://api.binance.com";
pub const BINANCE_TESTNET_BASE: &str = "https://testnet.binance.vision";
const REQUESTS_PER_MINUTE: u32 = 600; // Well under the 1200 weight/min IP limit
const RECV_WINDOW_MS: u64 = 5000;

// Error codes that mean "try again later" rather than "order is invalid"
const RETRYABLE_CODES: &[i64] = &[
    -1003, // too many requests
    -1007, // timeout waiting for backend
    -1021, // timestamp outside recvWindow
];

type HmacSha256 = Hmac<Sha256>;

type BinanceRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// API key pair for signed endpoints
#[derive(Clone)]
pub struct BinanceCredentials {
    pub api_key: String,
    pub secret: String,
}

impl BinanceCredentials {
    /// Read `BINANCE_API_KEY` / `BINANCE_SECRET`; None if either is missing or empty
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("BINANCE_API_KEY").ok()?;
        let secret = std::env::var("BINANCE_SECRET").ok()?;
        if api_key.trim().is_empty() || secret.trim().is_empty() {
            return None;
        }
        Some(Self { api_key, secret })
    }

    fn sign(&self, payload: &str) -> Result<String, String> {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).map_err(|e| e.to_string())?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

impl fmt::Debug for BinanceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinanceCredentials")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Binance spot REST client
///
/// Market data and account reads go to the testnet when `sandbox` is set at
/// construction; order submission is routed per call by the flag the
/// execution gate forwards.
#[derive(Clone)]
pub struct BinanceClient {
    client: Client,
    production_url: String,
    sandbox_url: String,
    sandbox: bool,
    credentials: Option<BinanceCredentials>,
    rate_limiter: Arc<BinanceRateLimiter>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfoResponse {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    symbol: String,
    filters: Vec<SymbolFilter>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolFilter {
    filter_type: String,
    #[serde(default)]
    min_qty: Option<String>,
    #[serde(default)]
    step_size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    balances: Vec<Balance>,
}

#[derive(Debug, Deserialize)]
struct Balance {
    asset: String,
    free: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: i64,
    client_order_id: String,
    executed_qty: String,
    status: String,
}

impl BinanceClient {
    pub fn new(
        credentials: Option<BinanceCredentials>,
        sandbox: bool,
        request_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("failed to build HTTP client: {}", e)))?;

        let per_minute = NonZeroU32::new(REQUESTS_PER_MINUTE).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_minute(per_minute)));

        Ok(Self {
            client,
            production_url: BINANCE_API_BASE.to_string(),
            sandbox_url: BINANCE_TESTNET_BASE.to_string(),
            sandbox,
            credentials,
            rate_limiter,
        })
    }

    /// Point the client at other hosts (mirrors, test servers)
    pub fn with_base_urls(
        mut self,
        production_url: impl Into<String>,
        sandbox_url: impl Into<String>,
    ) -> Self {
        self.production_url = production_url.into().trim_end_matches('/').to_string();
        self.sandbox_url = sandbox_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    fn base_url(&self, sandbox: bool) -> &str {
        if sandbox {
            &self.sandbox_url
        } else {
            &self.production_url
        }
    }

    /// "BTC/USDT" -> "BTCUSDT"
    pub fn market_symbol(symbol: &str) -> String {
        symbol.replace('/', "").to_uppercase()
    }

    /// Deterministic per (side, symbol, candle), so a retry can be matched to
    /// the first attempt in the exchange order history
    ///
    /// Binance only rejects a duplicate id while the first order is still
    /// open. A market order that filled before a timeout is not open, so its
    /// retry can fill again.
    pub fn client_order_id(intent: &OrderIntent) -> String {
        let side = match intent.side {
            Side::Buy => 'b',
            Side::Sell => 's',
        };
        format!(
            "xb{}{}{}",
            side,
            Self::market_symbol(&intent.symbol).to_lowercase(),
            intent.reference_candle_time.timestamp_millis()
        )
    }

    async fn public_get(&self, path: &str, query: &str) -> Result<String, SourceError> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}{}?{}", self.base_url(self.sandbox), path, query);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SourceError::Transient(format!("GET {} failed: {}", path, e)))?;

        read_source_body(path, response).await
    }

    fn signed_query(&self, params: &[(&str, String)]) -> Result<(String, &str), String> {
        let credentials = self
            .credentials
            .as_ref()
            .ok_or_else(|| "missing API credentials".to_string())?;

        let mut query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>();
        query.push(format!("recvWindow={}", RECV_WINDOW_MS));
        query.push(format!("timestamp={}", Utc::now().timestamp_millis()));
        let query = query.join("&");

        let signature = credentials.sign(&query)?;
        Ok((
            format!("{}&signature={}", query, signature),
            credentials.api_key.as_str(),
        ))
    }

    async fn signed_request(
        &self,
        method: Method,
        sandbox: bool,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<reqwest::Response, SignedRequestError> {
        let (query, api_key) = self
            .signed_query(params)
            .map_err(SignedRequestError::Credentials)?;

        self.rate_limiter.until_ready().await;

        let url = format!("{}{}?{}", self.base_url(sandbox), path, query);
        self.client
            .request(method, &url)
            .header("X-MBX-APIKEY", api_key)
            .send()
            .await
            .map_err(|e| SignedRequestError::Transport(e.to_string()))
    }
}

enum SignedRequestError {
    Credentials(String),
    Transport(String),
}

async fn read_source_body(path: &str, response: reqwest::Response) -> Result<String, SourceError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| SourceError::Transient(format!("reading {} failed: {}", path, e)))?;

    if status.is_success() {
        return Ok(body);
    }
    if is_retryable_status(status) {
        return Err(SourceError::Transient(format!(
            "{} returned {}: {}",
            path, status, body
        )));
    }
    Err(SourceError::Invalid(format!(
        "{} returned {}: {}",
        path, status, body
    )))
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::IM_A_TEAPOT // IP ban after ignoring 429s
        || status.is_server_error()
}

/// Map a failed order response onto the transient/rejected split
pub fn classify_order_failure(status: StatusCode, body: &str) -> SinkError {
    if is_retryable_status(status) {
        return SinkError::Transient(format!("HTTP {}: {}", status, body));
    }

    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(err) if RETRYABLE_CODES.contains(&err.code) => {
            SinkError::Transient(format!("code {}: {}", err.code, err.msg))
        }
        Ok(err) => SinkError::Rejected {
            code: Some(err.code),
            reason: err.msg,
        },
        Err(_) => SinkError::Rejected {
            code: None,
            reason: format!("HTTP {}: {}", status, body),
        },
    }
}

fn parse_decimal(field: &str, raw: &str) -> Result<Decimal, SourceError> {
    Decimal::from_str(raw)
        .map_err(|e| SourceError::Invalid(format!("bad {} '{}': {}", field, raw, e)))
}

fn millis_to_utc(ms: i64) -> Result<DateTime<Utc>, SourceError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| SourceError::Invalid(format!("bad timestamp {}", ms)))
}

/// Parse one kline row; returns the candle and its close time in ms
fn parse_kline(row: &[serde_json::Value]) -> Result<(Candle, i64), SourceError> {
    if row.len() < 7 {
        return Err(SourceError::Invalid(format!(
            "kline row has {} fields",
            row.len()
        )));
    }

    let number = |i: usize| {
        row[i]
            .as_i64()
            .ok_or_else(|| SourceError::Invalid(format!("kline field {} is not an integer", i)))
    };
    let decimal = |i: usize, name: &str| {
        let raw = row[i]
            .as_str()
            .ok_or_else(|| SourceError::Invalid(format!("kline {} is not a string", name)))?;
        parse_decimal(name, raw)
    };

    let candle = Candle {
        open_time: millis_to_utc(number(0)?)?,
        open: decimal(1, "open")?,
        high: decimal(2, "high")?,
        low: decimal(3, "low")?,
        close: decimal(4, "close")?,
        volume: decimal(5, "volume")?,
    };

    Ok((candle, number(6)?))
}

/// Keep only rows whose interval ended before `now_ms`, oldest first
fn closed_candles(
    rows: Vec<Vec<serde_json::Value>>,
    now_ms: i64,
    limit: usize,
) -> Result<Vec<Candle>, SourceError> {
    let mut candles = Vec::with_capacity(rows.len());
    for row in &rows {
        let (candle, close_time) = parse_kline(row)?;
        if close_time < now_ms {
            candles.push(candle);
        }
    }

    let skip = candles.len().saturating_sub(limit);
    Ok(candles.into_iter().skip(skip).collect())
}

#[async_trait]
impl CandleSource for BinanceClient {
    async fn fetch_latest_closed_candle(
        &self,
        symbol: &str,
        timeframe: &str,
    ) -> Result<Candle, SourceError> {
        self.fetch_closed_candles(symbol, timeframe, 1)
            .await?
            .pop()
            .ok_or_else(|| SourceError::Invalid(format!("no closed candle for {}", symbol)))
    }

    async fn fetch_closed_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, SourceError> {
        // One extra row: the newest kline is usually still open
        let query = format!(
            "symbol={}&interval={}&limit={}",
            Self::market_symbol(symbol),
            timeframe,
            limit + 1
        );
        let body = self.public_get("/api/v3/klines", &query).await?;
        let rows: Vec<Vec<serde_json::Value>> = serde_json::from_str(&body)
            .map_err(|e| SourceError::Invalid(format!("bad klines payload: {}", e)))?;

        let candles = closed_candles(rows, Utc::now().timestamp_millis(), limit)?;
        tracing::debug!(
            symbol = %symbol,
            timeframe = %timeframe,
            count = candles.len(),
            "Fetched closed candles"
        );
        Ok(candles)
    }

    async fn fetch_market_rules(&self, symbol: &str) -> Result<MarketRules, SourceError> {
        let market = Self::market_symbol(symbol);
        let body = self
            .public_get("/api/v3/exchangeInfo", &format!("symbol={}", market))
            .await?;
        let info: ExchangeInfoResponse = serde_json::from_str(&body)
            .map_err(|e| SourceError::Invalid(format!("bad exchangeInfo payload: {}", e)))?;

        let lot_size = info
            .symbols
            .iter()
            .find(|s| s.symbol == market)
            .and_then(|s| s.filters.iter().find(|f| f.filter_type == "LOT_SIZE"))
            .ok_or_else(|| SourceError::Invalid(format!("no LOT_SIZE filter for {}", market)))?;

        let min_order_size = parse_decimal("minQty", lot_size.min_qty.as_deref().unwrap_or("0"))?;
        let step_size = parse_decimal("stepSize", lot_size.step_size.as_deref().unwrap_or("0"))?;

        Ok(MarketRules {
            min_order_size: min_order_size.normalize(),
            step_size: step_size.normalize(),
        })
    }
}

#[async_trait]
impl AccountSource for BinanceClient {
    async fn fetch_account_state(&self, symbol: &str) -> Result<AccountState, SourceError> {
        let (base, quote) = split_symbol(symbol)
            .ok_or_else(|| SourceError::Invalid(format!("symbol {} is not BASE/QUOTE", symbol)))?;

        let response = self
            .signed_request(Method::GET, self.sandbox, "/api/v3/account", &[])
            .await
            .map_err(|e| match e {
                SignedRequestError::Credentials(msg) => SourceError::Invalid(msg),
                SignedRequestError::Transport(msg) => SourceError::Transient(msg),
            })?;
        let body = read_source_body("/api/v3/account", response).await?;
        let account: AccountResponse = serde_json::from_str(&body)
            .map_err(|e| SourceError::Invalid(format!("bad account payload: {}", e)))?;

        let free = |asset: &str| -> Result<Decimal, SourceError> {
            account
                .balances
                .iter()
                .find(|b| b.asset.eq_ignore_ascii_case(asset))
                .map(|b| parse_decimal("free", &b.free))
                .unwrap_or(Ok(Decimal::ZERO))
        };

        Ok(AccountState {
            available_balance: free(quote)?,
            position_quantity: free(base)?,
        })
    }
}

#[async_trait]
impl OrderSink for BinanceClient {
    async fn submit(
        &self,
        intent: &OrderIntent,
        sandbox: bool,
    ) -> Result<OrderConfirmation, SinkError> {
        let params = [
            ("symbol", Self::market_symbol(&intent.symbol)),
            ("side", intent.side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", intent.quantity.normalize().to_string()),
            ("newClientOrderId", Self::client_order_id(intent)),
        ];

        tracing::info!(
            symbol = %intent.symbol,
            side = %intent.side,
            quantity = %intent.quantity,
            sandbox,
            "Submitting market order"
        );

        let response = self
            .signed_request(Method::POST, sandbox, "/api/v3/order", &params)
            .await
            .map_err(|e| match e {
                SignedRequestError::Credentials(msg) => SinkError::Rejected {
                    code: None,
                    reason: msg,
                },
                SignedRequestError::Transport(msg) => SinkError::Transient(msg),
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SinkError::Transient(format!("reading order response failed: {}", e)))?;

        if !status.is_success() {
            return Err(classify_order_failure(status, &body));
        }

        let order: OrderResponse = serde_json::from_str(&body).map_err(|e| {
            SinkError::Transient(format!("unreadable order response ({}): {}", e, body))
        })?;

        // the order is already placed; a bad quantity field must not trigger a retry
        let executed_quantity = Decimal::from_str(&order.executed_qty).unwrap_or_else(|e| {
            tracing::warn!(
                symbol = %intent.symbol,
                order_id = order.order_id,
                executed_qty = %order.executed_qty,
                error = %e,
                "Unreadable executed quantity in order response, recording zero"
            );
            Decimal::ZERO
        });

        Ok(OrderConfirmation {
            order_id: order.order_id.to_string(),
            client_order_id: order.client_order_id,
            symbol: intent.symbol.clone(),
            side: intent.side,
            executed_quantity,
            status: order.status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn row(open_ms: i64, close: &str, close_ms: i64) -> Vec<serde_json::Value> {
        json!([open_ms, "1.0", "2.0", "0.5", close, "10.0", close_ms, "0", 1, "0", "0", "0"])
            .as_array()
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_market_symbol() {
        assert_eq!(BinanceClient::market_symbol("BTC/USDT"), "BTCUSDT");
        assert_eq!(BinanceClient::market_symbol("eth/btc"), "ETHBTC");
    }

    #[test]
    fn test_client_order_id_is_deterministic() {
        let intent = OrderIntent {
            symbol: "BTC/USDT".to_string(),
            side: Side::Buy,
            quantity: dec!(0.01),
            reference_candle_time: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
            reference_price: dec!(35000),
        };

        let id = BinanceClient::client_order_id(&intent);
        assert_eq!(id, "xbbbtcusdt1700000000000");
        assert_eq!(id, BinanceClient::client_order_id(&intent.clone()));
        assert!(id.len() <= 36);
    }

    #[test]
    fn test_closed_candles_drop_open_interval() {
        let rows = vec![
            row(0, "1.5", 59_999),
            row(60_000, "1.6", 119_999),
            row(120_000, "1.7", 179_999),
        ];

        let candles = closed_candles(rows, 150_000, 5).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[1].close, dec!(1.6));
    }

    #[test]
    fn test_closed_candles_respect_limit() {
        let rows = vec![
            row(0, "1.5", 59_999),
            row(60_000, "1.6", 119_999),
            row(120_000, "1.7", 179_999),
        ];

        let candles = closed_candles(rows, 200_000, 2).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].close, dec!(1.6));
        assert_eq!(candles[1].close, dec!(1.7));
    }

    #[test]
    fn test_malformed_kline_is_invalid() {
        let rows = vec![json!([0, 1.5]).as_array().cloned().unwrap()];
        assert!(matches!(
            closed_candles(rows, 1, 1),
            Err(SourceError::Invalid(_))
        ));
    }

    #[test]
    fn test_classify_rate_limit_as_transient() {
        let err = classify_order_failure(StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(err.is_retryable());

        let err = classify_order_failure(StatusCode::BAD_GATEWAY, "");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_classify_exchange_rejection() {
        let err = classify_order_failure(
            StatusCode::BAD_REQUEST,
            r#"{"code":-2010,"msg":"Account has insufficient balance for requested action."}"#,
        );
        assert_eq!(
            err,
            SinkError::Rejected {
                code: Some(-2010),
                reason: "Account has insufficient balance for requested action.".to_string(),
            }
        );
    }

    #[test]
    fn test_classify_timestamp_drift_as_transient() {
        let err = classify_order_failure(
            StatusCode::BAD_REQUEST,
            r#"{"code":-1021,"msg":"Timestamp for this request is outside of the recvWindow."}"#,
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn test_signature_is_hex_sha256() {
        let credentials = BinanceCredentials {
            api_key: "key".to_string(),
            secret: "secret".to_string(),
        };
        let signature = credentials.sign("symbol=BTCUSDT").unwrap();

        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
        let debug = format!("{:?}", credentials);
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("\"secret\""));
    }
}

// =============================================================================
// Alpaca REST client
// =============================================================================
//
// SECURITY: the secret key is sent only as a request header and never logged
// or serialized. All calls pass through the shared rate limiter before
// reaching the wire; idempotent GETs additionally pass through the retry
// helper. Order submission is deliberately retry-free.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::market_data::Candle;
use crate::types::{MarketMode, OrderState, OrderType};

use super::error::GatewayError;
use super::rate_limit::RateLimiter;
use super::retry::retry_idempotent;
use super::symbols;
use super::{Account, AssetInfo, BrokerGateway, BrokerOrder, BrokerPosition, OrderRequest};

/// How long a clock reading stays fresh before the broker is asked again.
const CLOCK_CACHE_TTL: Duration = Duration::from_secs(30);

pub struct AlpacaClient {
    trading_base: String,
    data_base: String,
    client: reqwest::Client,
    limiter: RateLimiter,
    max_retries: u32,
    clock_cache: RwLock<Option<(Instant, bool)>>,
}

impl AlpacaClient {
    /// Create a client against the paper-trading host. `api_key` / `secret`
    /// are sent as headers on every request.
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        rate_limit_per_min: u32,
        max_retries: u32,
    ) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("APCA-API-KEY-ID", val);
        }
        if let Ok(mut val) = HeaderValue::from_str(&secret) {
            val.set_sensitive(true);
            default_headers.insert("APCA-API-SECRET-KEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let trading_base = std::env::var("ALPACA_TRADING_URL")
            .unwrap_or_else(|_| "https://paper-api.alpaca.markets".to_string());
        let data_base = std::env::var("ALPACA_DATA_URL")
            .unwrap_or_else(|_| "https://data.alpaca.markets".to_string());

        debug!(trading_base = %trading_base, data_base = %data_base, "AlpacaClient initialised");

        Self {
            trading_base,
            data_base,
            client,
            limiter: RateLimiter::new(rate_limit_per_min),
            max_retries,
            clock_cache: RwLock::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // Low-level request helpers
    // -------------------------------------------------------------------------

    async fn get_json(&self, url: &str) -> Result<serde_json::Value, GatewayError> {
        self.limiter.acquire().await;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(GatewayError::from_transport)?;

        let status = resp.status();
        let text = resp.text().await.map_err(GatewayError::from_transport)?;

        if !status.is_success() {
            return Err(GatewayError::from_status(status, &text));
        }

        serde_json::from_str(&text)
            .map_err(|e| GatewayError::Fatal(format!("malformed broker response: {e}")))
    }

    /// GET with the transient-retry policy applied.
    async fn get_json_retried(&self, label: &str, url: &str) -> Result<serde_json::Value, GatewayError> {
        retry_idempotent(label, self.max_retries, || self.get_json(url)).await
    }
}

// =============================================================================
// Wire shapes
// =============================================================================

#[derive(Debug, Deserialize)]
struct RawOrder {
    id: String,
    client_order_id: String,
    status: String,
    #[serde(default)]
    filled_avg_price: Option<Decimal>,
    #[serde(default)]
    filled_qty: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct RawBar {
    t: DateTime<Utc>,
    o: Decimal,
    h: Decimal,
    l: Decimal,
    c: Decimal,
    v: Decimal,
}

impl From<RawBar> for Candle {
    fn from(raw: RawBar) -> Self {
        Candle {
            t: raw.t,
            o: raw.o,
            h: raw.h,
            l: raw.l,
            c: raw.c,
            v: raw.v,
        }
    }
}

/// Map the broker's order status string to the engine's state set.
pub(crate) fn map_order_status(status: &str) -> OrderState {
    match status {
        "pending_new" => OrderState::PendingNew,
        "new" | "accepted" | "pending_cancel" | "pending_replace" => OrderState::Accepted,
        "partially_filled" => OrderState::PartiallyFilled,
        "filled" => OrderState::Filled,
        "canceled" | "stopped" | "suspended" => OrderState::Cancelled,
        "rejected" => OrderState::Rejected,
        "expired" | "done_for_day" => OrderState::Expired,
        other => {
            warn!(status = other, "unknown broker order status — treating as accepted");
            OrderState::Accepted
        }
    }
}

fn broker_order_from_raw(raw: RawOrder) -> BrokerOrder {
    BrokerOrder {
        state: map_order_status(&raw.status),
        broker_id: raw.id,
        client_order_id: raw.client_order_id,
        filled_avg_price: raw.filled_avg_price,
        filled_qty: raw.filled_qty.unwrap_or_default(),
    }
}

// =============================================================================
// BrokerGateway implementation
// =============================================================================

#[async_trait]
impl BrokerGateway for AlpacaClient {
    #[instrument(skip(self, req), fields(symbol = %req.symbol, side = %req.side), name = "alpaca::submit_order")]
    async fn submit_order(&self, req: &OrderRequest) -> Result<BrokerOrder, GatewayError> {
        self.limiter.acquire().await;

        let mut body = serde_json::json!({
            "symbol": symbols::broker_form(&req.symbol, req.market_mode),
            "qty": req.qty.to_string(),
            "side": req.side.to_string(),
            "type": req.order_type.to_string(),
            "time_in_force": req.tif.to_string(),
            "client_order_id": req.client_order_id,
        });
        if req.order_type == OrderType::Limit {
            let limit = req
                .limit_price
                .ok_or_else(|| GatewayError::Fatal("limit order without limit_price".into()))?;
            body["limit_price"] = serde_json::Value::String(limit.to_string());
        }

        let url = format!("{}/v2/orders", self.trading_base);
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(GatewayError::from_transport)?;

        let status = resp.status();
        let text = resp.text().await.map_err(GatewayError::from_transport)?;
        if !status.is_success() {
            return Err(GatewayError::from_status(status, &text));
        }

        let raw: RawOrder = serde_json::from_str(&text)
            .map_err(|e| GatewayError::Fatal(format!("malformed order response: {e}")))?;

        debug!(broker_id = %raw.id, status = %raw.status, "order submitted");
        Ok(broker_order_from_raw(raw))
    }

    #[instrument(skip(self), name = "alpaca::cancel_order")]
    async fn cancel_order(&self, broker_id: &str) -> Result<(), GatewayError> {
        self.limiter.acquire().await;

        let url = format!("{}/v2/orders/{broker_id}", self.trading_base);
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(GatewayError::from_transport)?;

        let status = resp.status();
        if status.is_success() || status.as_u16() == 404 {
            // Already gone counts as cancelled.
            return Ok(());
        }
        let text = resp.text().await.map_err(GatewayError::from_transport)?;
        Err(GatewayError::from_status(status, &text))
    }

    #[instrument(skip(self), name = "alpaca::get_order_by_client_id")]
    async fn get_order_by_client_id(
        &self,
        client_order_id: &str,
    ) -> Result<Option<BrokerOrder>, GatewayError> {
        let url = format!(
            "{}/v2/orders:by_client_order_id?client_order_id={client_order_id}",
            self.trading_base
        );
        match self.get_json_retried("get_order_by_client_id", &url).await {
            Ok(value) => {
                let raw: RawOrder = serde_json::from_value(value)
                    .map_err(|e| GatewayError::Fatal(format!("malformed order response: {e}")))?;
                Ok(Some(broker_order_from_raw(raw)))
            }
            Err(GatewayError::Fatal(msg)) if msg.starts_with("404") => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), name = "alpaca::get_account")]
    async fn get_account(&self) -> Result<Account, GatewayError> {
        let url = format!("{}/v2/account", self.trading_base);
        let value = self.get_json_retried("get_account", &url).await?;
        serde_json::from_value(value)
            .map_err(|e| GatewayError::Fatal(format!("malformed account response: {e}")))
    }

    #[instrument(skip(self), name = "alpaca::list_positions")]
    async fn list_positions(&self) -> Result<Vec<BrokerPosition>, GatewayError> {
        let url = format!("{}/v2/positions", self.trading_base);
        let value = self.get_json_retried("list_positions", &url).await?;
        let mut positions: Vec<BrokerPosition> = serde_json::from_value(value)
            .map_err(|e| GatewayError::Fatal(format!("malformed positions response: {e}")))?;
        for p in &mut positions {
            p.symbol = symbols::canonical(&p.symbol);
        }
        Ok(positions)
    }

    #[instrument(skip(self), name = "alpaca::get_bars")]
    async fn get_bars(
        &self,
        symbol: &str,
        mode: MarketMode,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, GatewayError> {
        let broker_symbol = symbols::broker_form(symbol, mode);

        let bars: Vec<RawBar> = match mode {
            MarketMode::Equities => {
                let url = format!(
                    "{}/v2/stocks/{broker_symbol}/bars?timeframe={timeframe}&limit={limit}",
                    self.data_base
                );
                #[derive(Deserialize)]
                struct StockBars {
                    #[serde(default)]
                    bars: Vec<RawBar>,
                }
                let value = self.get_json_retried("get_bars", &url).await?;
                let parsed: StockBars = serde_json::from_value(value)
                    .map_err(|e| GatewayError::Fatal(format!("malformed bars response: {e}")))?;
                parsed.bars
            }
            MarketMode::Crypto => {
                let url = format!(
                    "{}/v1beta3/crypto/us/bars?symbols={broker_symbol}&timeframe={timeframe}&limit={limit}",
                    self.data_base
                );
                #[derive(Deserialize)]
                struct CryptoBars {
                    #[serde(default)]
                    bars: HashMap<String, Vec<RawBar>>,
                }
                let value = self.get_json_retried("get_bars", &url).await?;
                let parsed: CryptoBars = serde_json::from_value(value)
                    .map_err(|e| GatewayError::Fatal(format!("malformed bars response: {e}")))?;
                parsed.bars.into_values().next().unwrap_or_default()
            }
        };

        debug!(symbol, count = bars.len(), "bars fetched");
        Ok(bars.into_iter().map(Candle::from).collect())
    }

    #[instrument(skip(self), name = "alpaca::get_asset")]
    async fn get_asset(
        &self,
        symbol: &str,
        mode: MarketMode,
    ) -> Result<Option<AssetInfo>, GatewayError> {
        let broker_symbol = symbols::broker_form(symbol, mode);
        let url = format!("{}/v2/assets/{broker_symbol}", self.trading_base);
        match self.get_json_retried("get_asset", &url).await {
            Ok(value) => {
                let mut info: AssetInfo = serde_json::from_value(value)
                    .map_err(|e| GatewayError::Fatal(format!("malformed asset response: {e}")))?;
                info.symbol = symbols::canonical(&info.symbol);
                Ok(Some(info))
            }
            Err(GatewayError::Fatal(msg)) if msg.starts_with("404") => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn is_market_open(&self, mode: MarketMode) -> bool {
        if mode == MarketMode::Crypto {
            return true;
        }

        if let Some((at, open)) = *self.clock_cache.read() {
            if at.elapsed() < CLOCK_CACHE_TTL {
                return open;
            }
        }

        let url = format!("{}/v2/clock", self.trading_base);
        match self.get_json_retried("get_clock", &url).await {
            Ok(value) => {
                let open = value
                    .get("is_open")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                *self.clock_cache.write() = Some((Instant::now(), open));
                open
            }
            Err(e) => {
                // Fail closed: without a clock reading the equities loop must
                // not trade.
                warn!(error = %e, "clock query failed — treating market as closed");
                false
            }
        }
    }
}

impl std::fmt::Debug for AlpacaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlpacaClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("trading_base", &self.trading_base)
            .field("data_base", &self.data_base)
            .finish()
    }
}

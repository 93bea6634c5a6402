// =============================================================================
// Broker Gateway — Alpaca-style REST + market-data WebSocket
// =============================================================================
//
// The only layer that knows broker wire details. Everything above it speaks
// canonical symbols and typed results; everything below is HTTP/WS plumbing.
// =============================================================================

pub mod client;
pub mod error;
pub mod rate_limit;
pub mod retry;
pub mod stream;
pub mod symbols;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::market_data::Candle;
use crate::types::{MarketMode, OrderSide, OrderState, OrderType, TimeInForce};
use error::GatewayError;

/// Parameters for a new order submission. `symbol` is canonical; the client
/// renders the broker form.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub symbol: String,
    pub market_mode: MarketMode,
    pub side: OrderSide,
    pub qty: Decimal,
    pub order_type: OrderType,
    pub tif: TimeInForce,
    pub limit_price: Option<Decimal>,
}

/// Broker's view of an order, returned on submission and reconciliation.
#[derive(Debug, Clone)]
pub struct BrokerOrder {
    pub broker_id: String,
    pub client_order_id: String,
    pub state: OrderState,
    pub filled_avg_price: Option<Decimal>,
    pub filled_qty: Decimal,
}

/// Account snapshot. Broker-reported values pass through unmodified; the
/// engine never tries to reconcile margin or negative-cash semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub portfolio_value: Decimal,
    pub buying_power: Decimal,
    pub equity: Decimal,
    pub last_equity: Decimal,
}

/// Broker-reported open position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub qty: Decimal,
    pub side: String,
    pub avg_entry_price: Decimal,
    #[serde(default)]
    pub market_value: Option<Decimal>,
    #[serde(default)]
    pub unrealized_pl: Option<Decimal>,
}

/// Tradability constraints advertised by the broker per asset. Crypto sizing
/// clamps to these at submission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetInfo {
    pub symbol: String,
    pub tradable: bool,
    #[serde(default)]
    pub min_order_size: Option<Decimal>,
    #[serde(default)]
    pub min_trade_increment: Option<Decimal>,
}

/// An event from the upstream market-data / order-update streams.
#[derive(Debug, Clone)]
pub enum MarketEvent {
    Bar { symbol: String, candle: Candle },
    Trade { symbol: String, price: Decimal, ts: DateTime<Utc> },
    Quote { symbol: String, bid: Decimal, ask: Decimal, ts: DateTime<Utc> },
    OrderUpdate(OrderUpdate),
}

/// Order lifecycle event from the broker's trade_updates stream.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub client_order_id: String,
    pub broker_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub state: OrderState,
    pub filled_avg_price: Option<Decimal>,
    pub filled_qty: Decimal,
    pub ts: DateTime<Utc>,
}

/// The seam between the engine and the broker. `AlpacaClient` is the
/// production implementation; tests drive the engine through a mock.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Submit a new order. Never retried internally on timeout; callers
    /// reconcile by client order id instead.
    async fn submit_order(&self, req: &OrderRequest) -> Result<BrokerOrder, GatewayError>;

    async fn cancel_order(&self, broker_id: &str) -> Result<(), GatewayError>;

    /// Look an order up by the client-assigned id (reconciliation path).
    async fn get_order_by_client_id(
        &self,
        client_order_id: &str,
    ) -> Result<Option<BrokerOrder>, GatewayError>;

    async fn get_account(&self) -> Result<Account, GatewayError>;

    async fn list_positions(&self) -> Result<Vec<BrokerPosition>, GatewayError>;

    /// History seed for the candle buffer, oldest-first.
    async fn get_bars(
        &self,
        symbol: &str,
        mode: MarketMode,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, GatewayError>;

    async fn get_asset(
        &self,
        symbol: &str,
        mode: MarketMode,
    ) -> Result<Option<AssetInfo>, GatewayError>;

    /// Whether the market for `mode` is currently open. Crypto is always
    /// open; equities consult the broker clock.
    async fn is_market_open(&self, mode: MarketMode) -> bool;
}

// =============================================================================
// Shared types used across the Pulse trading engine
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Which market a symbol trades in. Determines the scheduler tick interval,
/// quantity representation (integer shares vs fractional), default time in
/// force, and whether the trading-hours gate applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketMode {
    Equities,
    Crypto,
}

impl MarketMode {
    /// Crypto quantities are fractional; equities are whole shares.
    pub fn fractional_qty(&self) -> bool {
        matches!(self, Self::Crypto)
    }

    /// Parse the `mode=crypto|stocks` query form used by the client API.
    pub fn from_query(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "crypto" => Some(Self::Crypto),
            "stocks" | "equities" => Some(Self::Equities),
            _ => None,
        }
    }
}

impl std::fmt::Display for MarketMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Equities => write!(f, "equities"),
            Self::Crypto => write!(f, "crypto"),
        }
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Order type. Only market and limit orders are submitted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "market"),
            Self::Limit => write!(f, "limit"),
        }
    }
}

/// Time in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce {
    Day,
    Gtc,
    Ioc,
}

impl TimeInForce {
    /// Broker-facing default per market mode: GTC for 24/7 crypto, Day for
    /// market-hours equities.
    pub fn default_for(mode: MarketMode) -> Self {
        match mode {
            MarketMode::Crypto => Self::Gtc,
            MarketMode::Equities => Self::Day,
        }
    }
}

impl std::fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Day => write!(f, "day"),
            Self::Gtc => write!(f, "gtc"),
            Self::Ioc => write!(f, "ioc"),
        }
    }
}

/// Order lifecycle states. Terminal states never transition further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    New,
    PendingNew,
    Accepted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Rejected | Self::Expired
        )
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::PendingNew => write!(f, "pending_new"),
            Self::Accepted => write!(f, "accepted"),
            Self::PartiallyFilled => write!(f, "partially_filled"),
            Self::Filled => write!(f, "filled"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Rejected => write!(f, "rejected"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

/// A tracked order. `id` is the client-assigned order id, unique for the
/// process lifetime; `broker_id` is assigned by the broker on acceptance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    #[serde(default)]
    pub broker_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: Decimal,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub tif: TimeInForce,
    pub market_mode: MarketMode,
    #[serde(default)]
    pub limit_price: Option<Decimal>,
    pub state: OrderState,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub filled_avg_price: Option<Decimal>,
    #[serde(default)]
    pub filled_qty: Decimal,
    /// Populated with the broker reason on rejection.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Direction of a trading signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl std::fmt::Display for SignalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
            Self::Hold => write!(f, "hold"),
        }
    }
}

/// Output of a strategy evaluation. `strength` is bounded to [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub action: SignalAction,
    pub strength: f64,
    pub reason: String,
    pub ts: DateTime<Utc>,
}

impl Signal {
    pub fn hold(symbol: &str, reason: impl Into<String>) -> Self {
        Self {
            symbol: symbol.to_string(),
            action: SignalAction::Hold,
            strength: 0.0,
            reason: reason.into(),
            ts: Utc::now(),
        }
    }
}

/// Per-symbol trade state. A symbol never jumps from `Idle` to `Held`; it
/// must pass through `EntryPending` and observe a filled order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeState {
    Idle,
    EntryPending,
    Held,
    ExitPending,
}

impl std::fmt::Display for TradeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::EntryPending => write!(f, "entry_pending"),
            Self::Held => write!(f, "held"),
            Self::ExitPending => write!(f, "exit_pending"),
        }
    }
}

/// Immutable audit record emitted once per fill. `realized_pnl` is populated
/// only on fills that reduce an open position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: Decimal,
    pub price: Decimal,
    pub value: Decimal,
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub realized_pnl: Option<Decimal>,
    #[serde(default)]
    pub realized_pnl_pct: Option<Decimal>,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_state_terminality() {
        assert!(OrderState::Filled.is_terminal());
        assert!(OrderState::Cancelled.is_terminal());
        assert!(OrderState::Rejected.is_terminal());
        assert!(OrderState::Expired.is_terminal());
        assert!(!OrderState::New.is_terminal());
        assert!(!OrderState::PendingNew.is_terminal());
        assert!(!OrderState::Accepted.is_terminal());
        assert!(!OrderState::PartiallyFilled.is_terminal());
    }

    #[test]
    fn market_mode_query_parsing() {
        assert_eq!(MarketMode::from_query("crypto"), Some(MarketMode::Crypto));
        assert_eq!(MarketMode::from_query("stocks"), Some(MarketMode::Equities));
        assert_eq!(MarketMode::from_query("STOCKS"), Some(MarketMode::Equities));
        assert_eq!(MarketMode::from_query("forex"), None);
    }

    #[test]
    fn tif_defaults_per_mode() {
        assert_eq!(TimeInForce::default_for(MarketMode::Crypto), TimeInForce::Gtc);
        assert_eq!(TimeInForce::default_for(MarketMode::Equities), TimeInForce::Day);
    }

    #[test]
    fn side_serialises_lowercase() {
        assert_eq!(serde_json::to_string(&OrderSide::Buy).unwrap(), "\"buy\"");
        assert_eq!(serde_json::to_string(&OrderSide::Sell).unwrap(), "\"sell\"");
    }
}

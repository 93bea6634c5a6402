// =============================================================================
// Central Application State
// =============================================================================
//
// The top-level runtime owns every subsystem; AppState ties them together so
// the API facade and scheduler loops can reach them through one Arc. There
// are no process-wide singletons: everything is wired by explicit
// construction in main.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::json;

use crate::alpaca::BrokerGateway;
use crate::config::RuntimeConfig;
use crate::hub::EventHub;
use crate::market_data::CandleBuffer;
use crate::metrics::MetricsAggregator;
use crate::orders::OrderManager;
use crate::positions::PositionTracker;
use crate::types::{MarketMode, Signal};

pub struct AppState {
    pub config: Arc<RwLock<RuntimeConfig>>,
    pub gateway: Arc<dyn BrokerGateway>,
    pub candle_buffer: Arc<CandleBuffer>,
    pub positions: Arc<PositionTracker>,
    pub metrics: Arc<MetricsAggregator>,
    pub hub: Arc<EventHub>,
    pub order_manager: Arc<OrderManager>,

    /// Latest signal per symbol, for `/api/signals/{symbol}`.
    pub latest_signals: RwLock<HashMap<String, Signal>>,

    pub start_time: std::time::Instant,
}

impl AppState {
    /// Record a freshly evaluated signal and push it to subscribers.
    pub fn record_signal(&self, signal: Signal) {
        self.hub.broadcast(
            "signal_update",
            Some(&signal.symbol),
            json!({
                "symbol": signal.symbol,
                "signal": signal.action,
                "strength": signal.strength,
                "reason": signal.reason,
            }),
        );
        self.latest_signals
            .write()
            .insert(signal.symbol.clone(), signal);
    }

    pub fn latest_signal(&self, symbol: &str) -> Option<Signal> {
        self.latest_signals.read().get(symbol).cloned()
    }

    /// Whether the scheduler loop for `mode` is currently acting on signals.
    pub fn mode_enabled(&self, mode: MarketMode) -> bool {
        let config = self.config.read();
        match mode {
            MarketMode::Crypto => config.crypto.enabled,
            MarketMode::Equities => config.equities.enabled,
        }
    }

    pub fn set_mode_enabled(&self, mode: MarketMode, enabled: bool) {
        let mut config = self.config.write();
        match mode {
            MarketMode::Crypto => config.crypto.enabled = enabled,
            MarketMode::Equities => config.equities.enabled = enabled,
        }
    }

    /// Which market mode a canonical symbol belongs to, by watchlist
    /// membership first, falling back to the crypto quote-suffix heuristic.
    pub fn infer_mode(&self, symbol: &str) -> MarketMode {
        let config = self.config.read();
        if config.crypto.symbols.iter().any(|s| s == symbol) {
            return MarketMode::Crypto;
        }
        if config.equities.symbols.iter().any(|s| s == symbol) {
            return MarketMode::Equities;
        }
        drop(config);
        if crate::alpaca::symbols::broker_form(symbol, MarketMode::Crypto).contains('/') {
            MarketMode::Crypto
        } else {
            MarketMode::Equities
        }
    }

    /// The connect-time snapshot for WebSocket clients: account, positions,
    /// recent trades, and session metrics. Broker failures degrade to nulls
    /// rather than failing the connection.
    pub async fn client_snapshot(&self) -> serde_json::Value {
        let account = match self.gateway.get_account().await {
            Ok(account) => serde_json::to_value(account).unwrap_or(serde_json::Value::Null),
            Err(_) => serde_json::Value::Null,
        };
        let positions = match self.gateway.list_positions().await {
            Ok(positions) => serde_json::to_value(positions).unwrap_or_default(),
            Err(_) => serde_json::Value::Array(Vec::new()),
        };
        let limit = self.config.read().event_hub.recent_trades;

        json!({
            "account": account,
            "positions": positions,
            "recent_trades": self.hub.recent_trades(limit),
            "metrics": self.metrics.snapshot(),
        })
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("uptime_s", &self.start_time.elapsed().as_secs())
            .field("hub", &self.hub)
            .finish()
    }
}

// =============================================================================
// REST endpoints — axum 0.7
// =============================================================================
//
// Thin projections over the engine components. Symbols are canonicalised at
// this boundary; broker errors surface as structured `{error_code, message}`
// payloads, never bare 500s.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::alpaca::error::GatewayError;
use crate::alpaca::symbols;
use crate::app_state::AppState;
use crate::orders::{SubmitOutcome, SubmitParams};
use crate::types::{MarketMode, OrderSide, OrderType, TimeInForce};

// =============================================================================
// Router construction
// =============================================================================

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/account", get(account))
        .route("/api/positions", get(positions))
        .route("/api/orders", get(orders).post(submit_order))
        .route("/api/orders/:id", delete(cancel_order))
        .route("/api/bars/*symbol", get(bars))
        .route("/api/signals/:symbol", get(signal))
        .route("/api/trade-log", get(trade_log))
        .route("/api/trading/start", post(trading_start))
        .route("/api/trading/stop", post(trading_stop))
        .route("/ws/trading", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

/// Broker errors become structured payloads with a non-500 status.
fn gateway_error_response(e: GatewayError) -> (StatusCode, Json<serde_json::Value>) {
    let (status, code) = match &e {
        GatewayError::Transient(_) => (StatusCode::SERVICE_UNAVAILABLE, "broker_unavailable"),
        GatewayError::WaitRequired(_) => (StatusCode::SERVICE_UNAVAILABLE, "wait_required"),
        GatewayError::Adjustable(_) => (StatusCode::UNPROCESSABLE_ENTITY, "order_adjustable"),
        GatewayError::Fatal(_) => (StatusCode::BAD_GATEWAY, "broker_error"),
    };
    (
        status,
        Json(json!({ "error_code": code, "message": e.to_string() })),
    )
}

// =============================================================================
// Health
// =============================================================================

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

// =============================================================================
// Account & positions
// =============================================================================

async fn account(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.gateway.get_account().await {
        Ok(account) => Json(account).into_response(),
        Err(e) => gateway_error_response(e).into_response(),
    }
}

#[derive(Deserialize)]
struct PositionsQuery {
    market_mode: Option<String>,
}

async fn positions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PositionsQuery>,
) -> impl IntoResponse {
    let mode = query.market_mode.as_deref().and_then(MarketMode::from_query);

    match state.gateway.list_positions().await {
        Ok(positions) => {
            let filtered: Vec<_> = positions
                .into_iter()
                .filter(|p| mode.map_or(true, |m| state.infer_mode(&p.symbol) == m))
                .collect();
            Json(filtered).into_response()
        }
        Err(e) => gateway_error_response(e).into_response(),
    }
}

// =============================================================================
// Orders
// =============================================================================

#[derive(Deserialize)]
struct OrdersQuery {
    status: Option<String>,
}

async fn orders(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OrdersQuery>,
) -> impl IntoResponse {
    let orders = match query.status.as_deref() {
        Some("open") => state.order_manager.open_orders(),
        _ => state.order_manager.all_orders(),
    };
    Json(orders)
}

#[derive(Deserialize)]
struct SubmitOrderBody {
    symbol: String,
    side: OrderSide,
    qty: Decimal,
    #[serde(rename = "type", default = "default_order_type")]
    order_type: OrderType,
    #[serde(default)]
    tif: Option<TimeInForce>,
    #[serde(default)]
    limit_price: Option<Decimal>,
    market_mode: MarketMode,
}

fn default_order_type() -> OrderType {
    OrderType::Market
}

async fn submit_order(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SubmitOrderBody>,
) -> impl IntoResponse {
    let symbol = symbols::canonical(&body.symbol);
    info!(symbol = %symbol, side = %body.side, qty = %body.qty, "manual order received");

    let outcome = state
        .order_manager
        .submit(SubmitParams {
            symbol,
            market_mode: body.market_mode,
            side: body.side,
            qty: Some(body.qty),
            order_type: body.order_type,
            tif: body.tif,
            limit_price: body.limit_price,
            reference_price: None,
        })
        .await;

    match outcome {
        SubmitOutcome::Submitted(order) => Json(order).into_response(),
        SubmitOutcome::DedupRejected { symbol, side } => (
            StatusCode::CONFLICT,
            Json(json!({
                "error_code": "dedup_rejected",
                "message": format!("an order for {symbol} {side} is already pending or cooling down"),
            })),
        )
            .into_response(),
        SubmitOutcome::MarketClosed => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({
                "error_code": "market_closed",
                "message": "equities market is closed",
            })),
        )
            .into_response(),
        SubmitOutcome::Rejected { reason } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error_code": "rejected", "message": reason })),
        )
            .into_response(),
    }
}

async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.order_manager.cancel(&id).await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(message) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error_code": "unknown_order", "message": message })),
        )
            .into_response(),
    }
}

// =============================================================================
// Bars & signals
// =============================================================================

#[derive(Deserialize)]
struct BarsQuery {
    #[serde(default = "default_timeframe")]
    timeframe: String,
    #[serde(default = "default_bars_limit")]
    limit: usize,
}

fn default_timeframe() -> String {
    "1Min".to_string()
}

fn default_bars_limit() -> usize {
    100
}

async fn bars(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<BarsQuery>,
) -> impl IntoResponse {
    let canonical = symbols::canonical(&symbol);
    let key = crate::market_data::CandleKey::new(canonical.clone(), query.timeframe.clone());

    // Serve from the live buffer when it has enough history; otherwise go to
    // the broker.
    let buffered = state.candle_buffer.last_n(&key, query.limit);
    if buffered.len() >= query.limit {
        let count = buffered.len();
        return Json(json!({ "bars": buffered, "count": count, "data_source": "buffer" }))
            .into_response();
    }

    let mode = state.infer_mode(&canonical);
    match state
        .gateway
        .get_bars(&canonical, mode, &query.timeframe, query.limit)
        .await
    {
        Ok(bars) => {
            let count = bars.len();
            Json(json!({ "bars": bars, "count": count, "data_source": "broker" })).into_response()
        }
        Err(e) => gateway_error_response(e).into_response(),
    }
}

async fn signal(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> impl IntoResponse {
    let canonical = symbols::canonical(&symbol);
    match state.latest_signal(&canonical) {
        Some(signal) => {
            let key = crate::market_data::CandleKey::new(
                canonical.clone(),
                state.config.read().candles.timeframe.clone(),
            );
            let price = state.candle_buffer.latest_close(&key);
            Json(json!({
                "symbol": signal.symbol,
                "signal": signal.action,
                "strength": signal.strength,
                "price": price,
                "ts": signal.ts,
            }))
            .into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error_code": "no_signal",
                "message": format!("no signal evaluated yet for {canonical}"),
            })),
        )
            .into_response(),
    }
}

// =============================================================================
// Trade log & trading control
// =============================================================================

#[derive(Deserialize)]
struct TradeLogQuery {
    #[serde(default = "default_trade_log_limit")]
    limit: usize,
}

fn default_trade_log_limit() -> usize {
    500
}

async fn trade_log(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TradeLogQuery>,
) -> impl IntoResponse {
    Json(json!({
        "trades": state.hub.recent_trades(query.limit),
        "metrics": state.metrics.snapshot(),
        "quarantined_symbols": state.order_manager.quarantined_symbols(),
    }))
}

#[derive(Deserialize)]
struct TradingModeQuery {
    mode: String,
}

async fn trading_start(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TradingModeQuery>,
) -> impl IntoResponse {
    toggle_trading(state, &query.mode, true)
}

async fn trading_stop(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TradingModeQuery>,
) -> impl IntoResponse {
    toggle_trading(state, &query.mode, false)
}

fn toggle_trading(state: Arc<AppState>, mode: &str, enabled: bool) -> axum::response::Response {
    let Some(mode) = MarketMode::from_query(mode) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error_code": "invalid_mode",
                "message": "mode must be crypto or stocks",
            })),
        )
            .into_response();
    };

    state.set_mode_enabled(mode, enabled);
    info!(mode = %mode, enabled, "trading loop toggled via API");
    state.hub.broadcast(
        "status",
        None,
        json!({
            "severity": "info",
            "message": format!("{mode} trading {}", if enabled { "started" } else { "stopped" }),
        }),
    );
    Json(json!({ "ok": true })).into_response()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use parking_lot::{Mutex, RwLock};
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc;

    use crate::alpaca::{
        Account, AssetInfo, BrokerGateway, BrokerOrder, BrokerPosition, OrderRequest,
    };
    use crate::config::RuntimeConfig;
    use crate::hub::EventHub;
    use crate::market_data::{Candle, CandleBuffer, CandleKey};
    use crate::metrics::MetricsAggregator;
    use crate::orders::OrderManager;
    use crate::positions::PositionTracker;
    use crate::types::OrderState;

    /// Gateway stub that records bar requests and serves a fixed history.
    struct BarsGateway {
        bar_calls: Mutex<Vec<(String, MarketMode, String, usize)>>,
    }

    impl BarsGateway {
        fn new() -> Self {
            Self {
                bar_calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BrokerGateway for BarsGateway {
        async fn submit_order(&self, req: &OrderRequest) -> Result<BrokerOrder, GatewayError> {
            Ok(BrokerOrder {
                broker_id: "stub".to_string(),
                client_order_id: req.client_order_id.clone(),
                state: OrderState::Accepted,
                filled_avg_price: None,
                filled_qty: Decimal::ZERO,
            })
        }

        async fn cancel_order(&self, _broker_id: &str) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn get_order_by_client_id(
            &self,
            _client_order_id: &str,
        ) -> Result<Option<BrokerOrder>, GatewayError> {
            Ok(None)
        }

        async fn get_account(&self) -> Result<Account, GatewayError> {
            Ok(Account {
                portfolio_value: dec!(1000),
                buying_power: dec!(1000),
                equity: dec!(1000),
                last_equity: dec!(1000),
            })
        }

        async fn list_positions(&self) -> Result<Vec<BrokerPosition>, GatewayError> {
            Ok(Vec::new())
        }

        async fn get_bars(
            &self,
            symbol: &str,
            mode: MarketMode,
            timeframe: &str,
            limit: usize,
        ) -> Result<Vec<Candle>, GatewayError> {
            self.bar_calls.lock().push((
                symbol.to_string(),
                mode,
                timeframe.to_string(),
                limit,
            ));
            Ok((0..limit as i64).map(|i| bar(i, dec!(37000))).collect())
        }

        async fn get_asset(
            &self,
            _symbol: &str,
            _mode: MarketMode,
        ) -> Result<Option<AssetInfo>, GatewayError> {
            Ok(None)
        }

        async fn is_market_open(&self, _mode: MarketMode) -> bool {
            true
        }
    }

    fn bar(minute: i64, close: Decimal) -> Candle {
        Candle {
            t: Utc.timestamp_opt(1_700_000_000 + minute * 60, 0).unwrap(),
            o: close,
            h: close + dec!(1),
            l: close - dec!(1),
            c: close,
            v: dec!(10),
        }
    }

    fn state_with(gateway: Arc<BarsGateway>) -> Arc<AppState> {
        let config = RuntimeConfig::default();
        let hub = Arc::new(EventHub::new(16, 16));
        let positions = Arc::new(PositionTracker::new());
        let (trade_tx, _trade_rx) = mpsc::unbounded_channel();
        let order_manager = Arc::new(OrderManager::new(
            gateway.clone(),
            positions.clone(),
            hub.clone(),
            trade_tx,
            config.order.clone(),
            &config.position,
            false,
        ));

        Arc::new(AppState {
            config: Arc::new(RwLock::new(config)),
            gateway,
            candle_buffer: Arc::new(CandleBuffer::new(100)),
            positions,
            metrics: Arc::new(MetricsAggregator::new()),
            hub,
            order_manager,
            latest_signals: RwLock::new(HashMap::new()),
            start_time: std::time::Instant::now(),
        })
    }

    async fn request_bars(state: Arc<AppState>, raw_symbol: &str, limit: usize) -> serde_json::Value {
        let response = bars(
            State(state),
            Path(raw_symbol.to_string()),
            Query(BarsQuery {
                timeframe: "1Min".to_string(),
                limit,
            }),
        )
        .await
        .into_response();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn crypto_bars_fall_back_to_broker_in_broker_form() {
        let gateway = Arc::new(BarsGateway::new());
        let state = state_with(gateway.clone());

        // The client may send the slashed form; the buffer is empty, so the
        // request goes to the broker.
        let payload = request_bars(state, "BTC/USD", 5).await;

        assert_eq!(payload["count"], 5);
        assert_eq!(payload["data_source"], "broker");
        assert_eq!(payload["bars"].as_array().unwrap().len(), 5);

        let calls = gateway.bar_calls.lock();
        assert_eq!(calls.len(), 1);
        let (symbol, mode, timeframe, limit) = calls[0].clone();
        // Canonical internally, and the broker form round-trips back to what
        // the broker expects.
        assert_eq!(symbol, "BTCUSD");
        assert_eq!(mode, MarketMode::Crypto);
        assert_eq!(symbols::broker_form(&symbol, mode), "BTC/USD");
        assert_eq!(timeframe, "1Min");
        assert_eq!(limit, 5);
    }

    #[tokio::test]
    async fn crypto_bars_serve_from_buffer_when_warm() {
        let gateway = Arc::new(BarsGateway::new());
        let state = state_with(gateway.clone());

        let key = CandleKey::new("BTCUSD", "1Min");
        for i in 0..6 {
            state.candle_buffer.append(key.clone(), bar(i, dec!(37000) + Decimal::from(i)));
        }

        let payload = request_bars(state, "btc-usd", 5).await;

        assert_eq!(payload["count"], 5);
        assert_eq!(payload["data_source"], "buffer");
        assert_eq!(payload["bars"].as_array().unwrap().len(), 5);
        // The warm buffer satisfied the request; the broker was never asked.
        assert!(gateway.bar_calls.lock().is_empty());
    }
}

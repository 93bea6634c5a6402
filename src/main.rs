// =============================================================================
// Pulse Scalp Engine — main entry point
// =============================================================================
//
// Both scheduler loops start disabled; trading is switched on explicitly via
// POST /api/trading/start. Exit codes: 0 normal, 1 configuration error,
// 2 broker auth failure, 3 fatal internal error.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pulse_bot::alpaca::client::AlpacaClient;
use pulse_bot::alpaca::error::GatewayError;
use pulse_bot::alpaca::stream::{run_market_stream, run_order_update_stream, StreamConfig};
use pulse_bot::alpaca::BrokerGateway;
use pulse_bot::api;
use pulse_bot::app_state::AppState;
use pulse_bot::config::RuntimeConfig;
use pulse_bot::hub::EventHub;
use pulse_bot::journal::TradeJournal;
use pulse_bot::market_data::{CandleBuffer, CandleKey};
use pulse_bot::metrics::{run_trade_consumer, MetricsAggregator};
use pulse_bot::orders::OrderManager;
use pulse_bot::positions::PositionTracker;
use pulse_bot::scheduler::ScalpingLoop;
use pulse_bot::strategy::{StochRsiEmaStrategy, Strategy};
use pulse_bot::types::MarketMode;

const CONFIG_PATH: &str = "pulse_config.json";

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Pulse Scalp Engine starting up");

    let mut config = match RuntimeConfig::load(CONFIG_PATH) {
        Ok(config) => config,
        Err(e) if e.downcast_ref::<std::io::Error>().is_some() => {
            warn!(error = %e, "no config file — using defaults");
            RuntimeConfig::default()
        }
        Err(e) => {
            error!(error = %e, "configuration file is invalid");
            return 1;
        }
    };

    if let Err(e) = config.apply_env_overrides() {
        error!(error = %e, "configuration error");
        return 1;
    }

    // Safety: never start trading unattended, whatever the file says.
    config.crypto.enabled = false;
    config.equities.enabled = false;

    info!(
        crypto = ?config.crypto.symbols,
        equities = ?config.equities.symbols,
        "watchlists configured (trading disabled until started via API)"
    );

    // ── 2. Broker gateway ────────────────────────────────────────────────
    let api_key = std::env::var("ALPACA_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("ALPACA_API_SECRET").unwrap_or_default();
    let gateway: Arc<dyn BrokerGateway> = Arc::new(AlpacaClient::new(
        api_key.clone(),
        api_secret.clone(),
        config.broker_rate_limit_per_min,
        config.order.max_retries_transient,
    ));

    // Fail fast on bad credentials; tolerate a transient outage.
    match gateway.get_account().await {
        Ok(account) => info!(equity = %account.equity, "broker account reachable"),
        Err(GatewayError::Fatal(reason)) => {
            error!(reason = %reason, "broker authentication failed");
            return 2;
        }
        Err(e) => warn!(error = %e, "broker not reachable at startup — continuing"),
    }

    // ── 3. Core components ───────────────────────────────────────────────
    let hub = Arc::new(EventHub::new(
        config.event_hub.outbox_size,
        config.event_hub.recent_trades,
    ));
    let candle_buffer = Arc::new(CandleBuffer::new(config.candles.buffer_size));
    let positions = Arc::new(PositionTracker::new());
    let metrics = Arc::new(MetricsAggregator::new());
    let journal = Arc::new(TradeJournal::new(&config.journal_path));

    let (trade_tx, trade_rx) = mpsc::unbounded_channel();
    let order_manager = Arc::new(OrderManager::new(
        gateway.clone(),
        positions.clone(),
        hub.clone(),
        trade_tx,
        config.order.clone(),
        &config.position,
        config.queue_when_closed,
    ));

    order_manager.preload_asset_info(&config.crypto.symbols).await;

    let timeframe = config.candles.timeframe.clone();
    let bind_addr = config.bind_addr.clone();
    let shutdown_grace = Duration::from_secs(config.shutdown_grace_seconds);
    let crypto_symbols = config.crypto.symbols.clone();
    let equities_symbols = config.equities.symbols.clone();
    let buffer_size = config.candles.buffer_size;

    let state = Arc::new(AppState {
        config: Arc::new(RwLock::new(config)),
        gateway: gateway.clone(),
        candle_buffer: candle_buffer.clone(),
        positions,
        metrics: metrics.clone(),
        hub: hub.clone(),
        order_manager: order_manager.clone(),
        latest_signals: RwLock::new(HashMap::new()),
        start_time: std::time::Instant::now(),
    });

    // ── 4. Seed candle history ───────────────────────────────────────────
    for (mode, symbols) in [
        (MarketMode::Crypto, &crypto_symbols),
        (MarketMode::Equities, &equities_symbols),
    ] {
        for symbol in symbols {
            match gateway.get_bars(symbol, mode, &timeframe, buffer_size).await {
                Ok(bars) => {
                    let key = CandleKey::new(symbol.clone(), timeframe.clone());
                    let accepted = candle_buffer.seed(&key, bars);
                    info!(symbol = %symbol, bars = accepted, "candle history seeded");
                }
                Err(e) => warn!(symbol = %symbol, error = %e, "history seed failed"),
            }
        }
    }

    // ── 5. Spawn the runtime ─────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    let stream_cfg = StreamConfig::from_env(api_key, api_secret);

    // Market-data ingestors, one per mode.
    for (mode, symbols) in [
        (MarketMode::Crypto, crypto_symbols.clone()),
        (MarketMode::Equities, equities_symbols.clone()),
    ] {
        if symbols.is_empty() {
            continue;
        }
        tasks.push(tokio::spawn(run_market_stream(
            stream_cfg.clone(),
            mode,
            symbols,
            timeframe.clone(),
            candle_buffer.clone(),
            cancel.clone(),
        )));
    }

    // Order updates: broker stream -> channel -> order manager.
    let (update_tx, update_rx) = mpsc::channel(256);
    tasks.push(tokio::spawn(run_order_update_stream(
        stream_cfg,
        update_tx,
        cancel.clone(),
    )));
    tasks.push(tokio::spawn(
        order_manager.clone().run_update_loop(update_rx, cancel.clone()),
    ));
    tasks.push(tokio::spawn(
        order_manager.clone().run_maintenance_loop(cancel.clone()),
    ));

    // Trade-event consumer (single writer for metrics + journal + hub).
    tasks.push(tokio::spawn(run_trade_consumer(
        trade_rx,
        metrics,
        hub.clone(),
        journal,
        cancel.clone(),
    )));

    // Scalping loops.
    let strategy: Arc<dyn Strategy> = Arc::new(StochRsiEmaStrategy);
    for mode in [MarketMode::Crypto, MarketMode::Equities] {
        let scalping = ScalpingLoop::new(state.clone(), strategy.clone(), mode);
        tasks.push(tokio::spawn(scalping.run(cancel.clone())));
    }

    // API server.
    let app = api::rest::router(state.clone());
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %bind_addr, error = %e, "failed to bind API server");
            return 3;
        }
    };
    info!(addr = %bind_addr, "API server listening");
    let server_cancel = cancel.clone();
    tasks.push(tokio::spawn(async move {
        let shutdown = async move { server_cancel.cancelled().await };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!(error = %e, "API server failed");
        }
    }));

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        cancel.cancel();
        return 3;
    }
    warn!("shutdown signal received — stopping");
    cancel.cancel();

    let drain = async {
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(shutdown_grace, drain).await.is_err() {
        warn!(
            grace_s = shutdown_grace.as_secs(),
            "shutdown grace expired with tasks still running"
        );
    }

    if let Err(e) = state.config.read().save(CONFIG_PATH) {
        warn!(error = %e, "failed to save config on shutdown");
    }

    info!("Pulse Scalp Engine shut down complete");
    0
}

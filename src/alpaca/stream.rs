// =============================================================================
// Upstream WebSocket ingestors — market data and order updates
// =============================================================================
//
// Two long-lived streams per process:
//   * market data (bars/trades/quotes) per market mode, feeding the candle
//     buffer
//   * trade_updates, feeding OrderUpdate events to the order manager
//
// Disconnects reconnect automatically with exponential backoff and
// resubscribe the last symbol set. Both loops exit promptly on cancellation.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::market_data::{Candle, CandleBuffer, CandleKey};
use crate::types::{MarketMode, OrderSide, OrderState};

use super::client::map_order_status;
use super::retry::backoff_delay;
use super::symbols;
use super::{MarketEvent, OrderUpdate};

/// Credentials and endpoints for the upstream streams.
#[derive(Clone)]
pub struct StreamConfig {
    pub api_key: String,
    pub secret: String,
    pub stocks_url: String,
    pub crypto_url: String,
    pub trading_ws_url: String,
}

impl StreamConfig {
    pub fn from_env(api_key: String, secret: String) -> Self {
        Self {
            api_key,
            secret,
            stocks_url: std::env::var("ALPACA_STOCKS_WS_URL")
                .unwrap_or_else(|_| "wss://stream.data.alpaca.markets/v2/iex".to_string()),
            crypto_url: std::env::var("ALPACA_CRYPTO_WS_URL")
                .unwrap_or_else(|_| "wss://stream.data.alpaca.markets/v1beta3/crypto/us".to_string()),
            trading_ws_url: std::env::var("ALPACA_TRADING_WS_URL")
                .unwrap_or_else(|_| "wss://paper-api.alpaca.markets/stream".to_string()),
        }
    }
}

impl std::fmt::Debug for StreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConfig")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("stocks_url", &self.stocks_url)
            .field("crypto_url", &self.crypto_url)
            .finish()
    }
}

// =============================================================================
// Market-data stream
// =============================================================================

/// Run the market-data stream for one mode until cancelled, reconnecting with
/// exponential backoff on every failure.
pub async fn run_market_stream(
    cfg: StreamConfig,
    mode: MarketMode,
    watch_symbols: Vec<String>,
    timeframe: String,
    buffer: Arc<CandleBuffer>,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return;
        }

        match market_stream_once(&cfg, mode, &watch_symbols, &timeframe, &buffer, &cancel).await {
            Ok(()) => {
                // Clean exit only happens on cancellation.
                return;
            }
            Err(e) => {
                let delay = backoff_delay(attempt);
                error!(
                    mode = %mode,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "market stream error — reconnecting"
                );
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

async fn market_stream_once(
    cfg: &StreamConfig,
    mode: MarketMode,
    watch_symbols: &[String],
    timeframe: &str,
    buffer: &Arc<CandleBuffer>,
    cancel: &CancellationToken,
) -> Result<()> {
    let url = match mode {
        MarketMode::Equities => &cfg.stocks_url,
        MarketMode::Crypto => &cfg.crypto_url,
    };

    info!(mode = %mode, url = %url, "connecting market-data stream");
    let (ws, _resp) = connect_async(url.as_str())
        .await
        .context("market-data WebSocket connect failed")?;
    let (mut write, mut read) = ws.split();

    // Authenticate, then resubscribe the full symbol set.
    let auth = serde_json::json!({
        "action": "auth",
        "key": cfg.api_key,
        "secret": cfg.secret,
    });
    write
        .send(Message::Text(auth.to_string()))
        .await
        .context("failed to send auth")?;

    let broker_symbols: Vec<String> = watch_symbols
        .iter()
        .map(|s| symbols::broker_form(s, mode))
        .collect();
    let subscribe = serde_json::json!({
        "action": "subscribe",
        "bars": broker_symbols,
    });
    write
        .send(Message::Text(subscribe.to_string()))
        .await
        .context("failed to send subscription")?;

    info!(mode = %mode, symbols = ?broker_symbols, "market-data stream subscribed");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    for event in parse_market_message(&text) {
                        handle_market_event(event, timeframe, buffer);
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    write.send(Message::Pong(data)).await.ok();
                }
                Some(Ok(Message::Close(_))) => {
                    anyhow::bail!("market stream closed by server");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => anyhow::bail!("market stream ended"),
            }
        }
    }
}

fn handle_market_event(event: MarketEvent, timeframe: &str, buffer: &Arc<CandleBuffer>) {
    match event {
        MarketEvent::Bar { symbol, candle } => {
            let key = CandleKey::new(symbol, timeframe);
            debug!(key = %key, close = %candle.c, "bar ingested");
            buffer.append(key, candle);
        }
        MarketEvent::Trade { symbol, price, .. } => {
            debug!(symbol = %symbol, price = %price, "trade tick");
        }
        MarketEvent::Quote { symbol, .. } => {
            debug!(symbol = %symbol, "quote tick");
        }
        MarketEvent::OrderUpdate(_) => {
            // Order updates arrive on the trading stream, never here.
        }
    }
}

/// Parse one frame from the data stream. The broker batches messages as a
/// JSON array; unknown message kinds are skipped.
pub fn parse_market_message(text: &str) -> Vec<MarketEvent> {
    #[derive(Deserialize)]
    struct RawMsg {
        #[serde(rename = "T")]
        kind: String,
        #[serde(rename = "S", default)]
        symbol: Option<String>,
        #[serde(default)]
        t: Option<DateTime<Utc>>,
        #[serde(default)]
        o: Option<Decimal>,
        #[serde(default)]
        h: Option<Decimal>,
        #[serde(default)]
        l: Option<Decimal>,
        #[serde(default)]
        c: Option<Decimal>,
        #[serde(default)]
        v: Option<Decimal>,
        #[serde(default)]
        p: Option<Decimal>,
        #[serde(default)]
        bp: Option<Decimal>,
        #[serde(default)]
        ap: Option<Decimal>,
        #[serde(default)]
        msg: Option<String>,
    }

    let Ok(messages) = serde_json::from_str::<Vec<RawMsg>>(text) else {
        warn!("unparseable market-data frame");
        return Vec::new();
    };

    let mut events = Vec::new();
    for m in messages {
        match m.kind.as_str() {
            "b" => {
                let (Some(sym), Some(t), Some(o), Some(h), Some(l), Some(c), Some(v)) =
                    (m.symbol, m.t, m.o, m.h, m.l, m.c, m.v)
                else {
                    continue;
                };
                events.push(MarketEvent::Bar {
                    symbol: symbols::canonical(&sym),
                    candle: Candle { t, o, h, l, c, v },
                });
            }
            "t" => {
                let (Some(sym), Some(t), Some(p)) = (m.symbol, m.t, m.p) else {
                    continue;
                };
                events.push(MarketEvent::Trade {
                    symbol: symbols::canonical(&sym),
                    price: p,
                    ts: t,
                });
            }
            "q" => {
                let (Some(sym), Some(t), Some(bp), Some(ap)) = (m.symbol, m.t, m.bp, m.ap) else {
                    continue;
                };
                events.push(MarketEvent::Quote {
                    symbol: symbols::canonical(&sym),
                    bid: bp,
                    ask: ap,
                    ts: t,
                });
            }
            "error" => {
                warn!(msg = ?m.msg, "market stream error message");
            }
            // success / subscription acks
            _ => {}
        }
    }
    events
}

// =============================================================================
// Order-update stream
// =============================================================================

/// Run the trade_updates stream until cancelled, forwarding order events to
/// the order manager. Reconnects with exponential backoff.
pub async fn run_order_update_stream(
    cfg: StreamConfig,
    tx: mpsc::Sender<OrderUpdate>,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return;
        }

        match order_stream_once(&cfg, &tx, &cancel).await {
            Ok(()) => return,
            Err(e) => {
                let delay = backoff_delay(attempt);
                error!(
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "trade_updates stream error — reconnecting"
                );
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

async fn order_stream_once(
    cfg: &StreamConfig,
    tx: &mpsc::Sender<OrderUpdate>,
    cancel: &CancellationToken,
) -> Result<()> {
    info!(url = %cfg.trading_ws_url, "connecting trade_updates stream");
    let (ws, _resp) = connect_async(cfg.trading_ws_url.as_str())
        .await
        .context("trade_updates WebSocket connect failed")?;
    let (mut write, mut read) = ws.split();

    let auth = serde_json::json!({
        "action": "auth",
        "key": cfg.api_key,
        "secret": cfg.secret,
    });
    write
        .send(Message::Text(auth.to_string()))
        .await
        .context("failed to send auth")?;

    let listen = serde_json::json!({
        "action": "listen",
        "data": { "streams": ["trade_updates"] },
    });
    write
        .send(Message::Text(listen.to_string()))
        .await
        .context("failed to send listen request")?;

    info!("trade_updates stream listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Some(update) = parse_order_update(&text) {
                        if tx.send(update).await.is_err() {
                            // Order manager is gone; nothing left to feed.
                            return Ok(());
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    write.send(Message::Pong(data)).await.ok();
                }
                Some(Ok(Message::Close(_))) => {
                    anyhow::bail!("trade_updates stream closed by server");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => anyhow::bail!("trade_updates stream ended"),
            }
        }
    }
}

/// Parse one trade_updates frame into an `OrderUpdate`. Non-order frames
/// (auth acks, listen acks) return `None`.
pub fn parse_order_update(text: &str) -> Option<OrderUpdate> {
    #[derive(Deserialize)]
    struct RawOrderBody {
        id: String,
        client_order_id: String,
        symbol: String,
        side: String,
        status: String,
        #[serde(default)]
        filled_avg_price: Option<Decimal>,
        #[serde(default)]
        filled_qty: Option<Decimal>,
    }

    #[derive(Deserialize)]
    struct RawData {
        #[serde(default)]
        event: Option<String>,
        order: RawOrderBody,
    }

    #[derive(Deserialize)]
    struct RawFrame {
        stream: String,
        data: RawData,
    }

    let frame: RawFrame = serde_json::from_str(text).ok()?;
    if frame.stream != "trade_updates" {
        return None;
    }

    let order = frame.data.order;
    let side = match order.side.as_str() {
        "buy" => OrderSide::Buy,
        "sell" => OrderSide::Sell,
        other => {
            warn!(side = other, "unknown order side in trade update");
            return None;
        }
    };

    // The event name is more current than the embedded order status during
    // partial fills.
    let state = match frame.data.event.as_deref() {
        Some("fill") => OrderState::Filled,
        Some("partial_fill") => OrderState::PartiallyFilled,
        Some("canceled") => OrderState::Cancelled,
        Some("rejected") => OrderState::Rejected,
        Some("expired") => OrderState::Expired,
        _ => map_order_status(&order.status),
    };

    Some(OrderUpdate {
        client_order_id: order.client_order_id,
        broker_id: order.id,
        symbol: symbols::canonical(&order.symbol),
        side,
        state,
        filled_avg_price: order.filled_avg_price,
        filled_qty: order.filled_qty.unwrap_or_default(),
        ts: Utc::now(),
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parse_bar_message() {
        let text = r#"[{"T":"b","S":"BTC/USD","o":37000.5,"h":37050.0,"l":36990.25,"c":37020.0,"v":123.456,"t":"2024-05-01T13:30:00Z"}]"#;
        let events = parse_market_message(text);
        assert_eq!(events.len(), 1);
        match &events[0] {
            MarketEvent::Bar { symbol, candle } => {
                assert_eq!(symbol, "BTCUSD");
                assert_eq!(candle.c, dec!(37020.0));
            }
            other => panic!("expected bar, got {other:?}"),
        }
    }

    #[test]
    fn parse_batch_with_control_messages() {
        let text = r#"[
            {"T":"success","msg":"authenticated"},
            {"T":"subscription","bars":["AAPL"]},
            {"T":"b","S":"AAPL","o":100.0,"h":101.0,"l":99.5,"c":100.5,"v":5000,"t":"2024-05-01T13:31:00Z"},
            {"T":"t","S":"AAPL","p":100.6,"t":"2024-05-01T13:31:02Z"}
        ]"#;
        let events = parse_market_message(text);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], MarketEvent::Bar { symbol, .. } if symbol == "AAPL"));
        assert!(matches!(&events[1], MarketEvent::Trade { symbol, .. } if symbol == "AAPL"));
    }

    #[test]
    fn malformed_frame_yields_nothing() {
        assert!(parse_market_message("not json").is_empty());
        assert!(parse_market_message(r#"{"T":"b"}"#).is_empty()); // not an array
    }

    #[test]
    fn parse_fill_update() {
        let text = r#"{
            "stream": "trade_updates",
            "data": {
                "event": "fill",
                "order": {
                    "id": "broker-1",
                    "client_order_id": "trade-1700000000000-1",
                    "symbol": "AAPL",
                    "side": "buy",
                    "status": "filled",
                    "filled_avg_price": "100.00",
                    "filled_qty": "10"
                }
            }
        }"#;
        let update = parse_order_update(text).unwrap();
        assert_eq!(update.state, OrderState::Filled);
        assert_eq!(update.symbol, "AAPL");
        assert_eq!(update.side, OrderSide::Buy);
        assert_eq!(update.filled_qty, dec!(10));
        assert_eq!(update.filled_avg_price, Some(dec!(100.00)));
    }

    #[test]
    fn parse_partial_fill_prefers_event_over_status() {
        let text = r#"{
            "stream": "trade_updates",
            "data": {
                "event": "partial_fill",
                "order": {
                    "id": "broker-2",
                    "client_order_id": "trade-1700000000000-2",
                    "symbol": "BTC/USD",
                    "side": "sell",
                    "status": "partially_filled",
                    "filled_avg_price": "37000.00",
                    "filled_qty": "0.5"
                }
            }
        }"#;
        let update = parse_order_update(text).unwrap();
        assert_eq!(update.state, OrderState::PartiallyFilled);
        assert_eq!(update.symbol, "BTCUSD");
    }

    #[test]
    fn non_trade_update_frames_are_ignored() {
        assert!(parse_order_update(r#"{"stream":"authorization","data":{"status":"authorized"}}"#).is_none());
        assert!(parse_order_update("junk").is_none());
    }
}

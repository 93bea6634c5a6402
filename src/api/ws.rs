// =============================================================================
// Client WebSocket — /ws/trading
// =============================================================================
//
// Protocol (JSON text frames, `{type, data, ts}` envelopes):
//   * on connect: a `snapshot` with account, positions, recent trades, and
//     session metrics
//   * then: hub events (trade_update, order_update, position_update,
//     signal_update, status) as they happen
//   * every 20s: a `status` heartbeat
//
// Client -> server: `{action: "subscribe"|"unsubscribe", symbols: [...]}`
// narrows the symbol filter; `{action: "replay", limit}` re-sends recent
// trades. Unknown actions are ignored.
//
// Backpressure: the hub drops subscribers whose outbox fills up; writes
// additionally carry a 2s timeout. Either way the offending client is
// disconnected and everyone else is unaffected.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::alpaca::symbols;
use crate::app_state::AppState;

/// Heartbeat period.
const HEARTBEAT_SECS: u64 = 20;
/// Per-message write budget; slower clients are disconnected.
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

#[derive(Deserialize)]
struct ClientAction {
    action: String,
    #[serde(default)]
    symbols: Vec<String>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let (subscriber_id, mut outbox) = state.hub.subscribe();
    info!(subscriber = subscriber_id, "client WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    // --- Initial snapshot ---------------------------------------------------
    let snapshot = json!({
        "type": "snapshot",
        "data": state.client_snapshot().await,
        "ts": Utc::now().to_rfc3339(),
    });
    if send_frame(&mut sender, snapshot.to_string()).await.is_err() {
        state.hub.unsubscribe(subscriber_id);
        return;
    }

    let mut heartbeat = tokio::time::interval(Duration::from_secs(HEARTBEAT_SECS));
    heartbeat.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            // --- Hub events -> client --------------------------------------
            frame = outbox.recv() => {
                let Some(frame) = frame else {
                    // The hub dropped us (slow subscriber).
                    info!(subscriber = subscriber_id, "hub closed outbox — disconnecting client");
                    break;
                };
                if send_frame(&mut sender, frame).await.is_err() {
                    break;
                }
            }

            // --- Heartbeat --------------------------------------------------
            _ = heartbeat.tick() => {
                let frame = json!({
                    "type": "status",
                    "data": { "heartbeat": true },
                    "ts": Utc::now().to_rfc3339(),
                });
                if send_frame(&mut sender, frame.to_string()).await.is_err() {
                    break;
                }
            }

            // --- Client -> server ------------------------------------------
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_action(&state, subscriber_id, &text, &mut sender).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(subscriber = subscriber_id, "client closed connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(subscriber = subscriber_id, error = %e, "client receive error");
                        break;
                    }
                }
            }
        }
    }

    state.hub.unsubscribe(subscriber_id);
    info!(subscriber = subscriber_id, "client WebSocket disconnected");
}

async fn handle_client_action<S>(
    state: &Arc<AppState>,
    subscriber_id: u64,
    text: &str,
    sender: &mut S,
) where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    let Ok(action) = serde_json::from_str::<ClientAction>(text) else {
        debug!(subscriber = subscriber_id, "unparseable client message ignored");
        return;
    };

    let canonical: Vec<String> = action.symbols.iter().map(|s| symbols::canonical(s)).collect();

    match action.action.as_str() {
        "subscribe" => {
            debug!(subscriber = subscriber_id, symbols = ?canonical, "subscribe");
            state.hub.add_symbols(subscriber_id, &canonical);
        }
        "unsubscribe" => {
            debug!(subscriber = subscriber_id, symbols = ?canonical, "unsubscribe");
            state.hub.remove_symbols(subscriber_id, &canonical);
        }
        "replay" => {
            let limit = action.limit.unwrap_or(100);
            for record in state.hub.recent_trades(limit) {
                let frame = json!({
                    "type": "trade_update",
                    "data": record,
                    "ts": Utc::now().to_rfc3339(),
                });
                if send_frame(sender, frame.to_string()).await.is_err() {
                    return;
                }
            }
        }
        other => {
            // Unknown actions are ignored by contract.
            debug!(subscriber = subscriber_id, action = other, "unknown action ignored");
        }
    }
}

/// Send one text frame with the write timeout applied.
async fn send_frame<S>(sender: &mut S, frame: String) -> Result<(), ()>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    match tokio::time::timeout(WRITE_TIMEOUT, sender.send(Message::Text(frame))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            debug!(error = %e, "WebSocket write failed");
            Err(())
        }
        Err(_) => {
            warn!("WebSocket write timed out — disconnecting client");
            Err(())
        }
    }
}

// =============================================================================
// Event Hub — bounded fan-out to client WebSocket subscribers
// =============================================================================
//
// Every subscriber gets its own bounded outbox. `broadcast` serialises the
// envelope once and try-sends to each outbox; a full outbox means the
// subscriber is too slow and is dropped on the spot. The producer never
// blocks on a client.
//
// The hub also owns the ring of recent trade records used for replay and the
// `/api/trade-log` endpoint.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::types::TradeRecord;

struct Subscriber {
    tx: mpsc::Sender<String>,
    /// Canonical symbols this subscriber wants. Empty means everything.
    filter: HashSet<String>,
}

pub struct EventHub {
    subscribers: RwLock<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    recent_trades: RwLock<VecDeque<TradeRecord>>,
    outbox_size: usize,
    ring_size: usize,
}

impl EventHub {
    pub fn new(outbox_size: usize, ring_size: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            recent_trades: RwLock::new(VecDeque::with_capacity(ring_size)),
            outbox_size,
            ring_size,
        }
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Register a subscriber and hand back its id and outbox receiver.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.outbox_size);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().insert(
            id,
            Subscriber {
                tx,
                filter: HashSet::new(),
            },
        );
        info!(subscriber = id, "hub subscriber added");
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        if self.subscribers.write().remove(&id).is_some() {
            info!(subscriber = id, "hub subscriber removed");
        }
    }

    /// Narrow (or widen) a subscriber's symbol filter.
    pub fn add_symbols(&self, id: u64, symbols: &[String]) {
        if let Some(sub) = self.subscribers.write().get_mut(&id) {
            sub.filter.extend(symbols.iter().cloned());
        }
    }

    pub fn remove_symbols(&self, id: u64, symbols: &[String]) {
        if let Some(sub) = self.subscribers.write().get_mut(&id) {
            for s in symbols {
                sub.filter.remove(s);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    // -------------------------------------------------------------------------
    // Broadcasting
    // -------------------------------------------------------------------------

    /// Fan an event out to every matching subscriber. Slow subscribers are
    /// disconnected rather than ever blocking the producer.
    pub fn broadcast(&self, event_type: &str, symbol: Option<&str>, data: serde_json::Value) {
        let envelope = serde_json::json!({
            "type": event_type,
            "data": data,
            "ts": Utc::now().to_rfc3339(),
        });
        let frame = envelope.to_string();

        let mut dropped: Vec<u64> = Vec::new();
        {
            let subs = self.subscribers.read();
            for (&id, sub) in subs.iter() {
                if let Some(sym) = symbol {
                    if !sub.filter.is_empty() && !sub.filter.contains(sym) {
                        continue;
                    }
                }
                match sub.tx.try_send(frame.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(subscriber = id, "outbox full — dropping slow subscriber");
                        dropped.push(id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!(subscriber = id, "outbox closed — removing subscriber");
                        dropped.push(id);
                    }
                }
            }
        }

        if !dropped.is_empty() {
            let mut subs = self.subscribers.write();
            for id in dropped {
                subs.remove(&id);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Trade ring
    // -------------------------------------------------------------------------

    /// Record a trade in the replay ring and broadcast it.
    pub fn record_trade(&self, record: TradeRecord) {
        {
            let mut ring = self.recent_trades.write();
            ring.push_back(record.clone());
            while ring.len() > self.ring_size {
                ring.pop_front();
            }
        }

        let symbol = record.symbol.clone();
        match serde_json::to_value(&record) {
            Ok(data) => self.broadcast("trade_update", Some(&symbol), data),
            Err(e) => warn!(error = %e, "trade record failed to serialise"),
        }
    }

    /// The most recent `limit` trades, oldest first.
    pub fn recent_trades(&self, limit: usize) -> Vec<TradeRecord> {
        let ring = self.recent_trades.read();
        let start = ring.len().saturating_sub(limit);
        ring.iter().skip(start).cloned().collect()
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("subscribers", &self.subscriber_count())
            .field("recent_trades", &self.recent_trades.read().len())
            .field("outbox_size", &self.outbox_size)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderSide;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn trade(symbol: &str) -> TradeRecord {
        TradeRecord {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side: OrderSide::Buy,
            qty: dec!(1),
            price: dec!(100),
            value: dec!(100),
            ts: Utc::now(),
            realized_pnl: None,
            realized_pnl_pct: None,
            status: "open".to_string(),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_broadcasts() {
        let hub = EventHub::new(16, 10);
        let (_id, mut rx) = hub.subscribe();

        hub.broadcast("status", None, serde_json::json!({"heartbeat": true}));
        let frame = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["type"], "status");
        assert_eq!(parsed["data"]["heartbeat"], true);
        assert!(parsed["ts"].is_string());
    }

    #[tokio::test]
    async fn symbol_filter_scopes_tagged_events() {
        let hub = EventHub::new(16, 10);
        let (id, mut rx) = hub.subscribe();
        hub.add_symbols(id, &["BTCUSD".to_string()]);

        hub.broadcast("signal_update", Some("ETHUSD"), serde_json::json!({}));
        hub.broadcast("signal_update", Some("BTCUSD"), serde_json::json!({}));
        // Untagged events always pass the filter.
        hub.broadcast("status", None, serde_json::json!({}));

        let first: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first["type"], "signal_update");
        let second: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(second["type"], "status");
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_fast_one_keeps_everything() {
        let hub = std::sync::Arc::new(EventHub::new(256, 10));

        // Slow subscriber: never reads.
        let (_slow_id, slow_rx) = hub.subscribe();

        // Fast subscriber: drains continuously.
        let (_fast_id, mut fast_rx) = hub.subscribe();
        let collector = tokio::spawn(async move {
            let mut count = 0usize;
            while fast_rx.recv().await.is_some() {
                count += 1;
            }
            count
        });

        const TOTAL: usize = 10_000;
        for i in 0..TOTAL {
            hub.broadcast("trade_update", None, serde_json::json!({"seq": i}));
            if i % 64 == 0 {
                tokio::task::yield_now().await;
            }
        }

        // The slow subscriber blew through its outbox and was removed.
        assert_eq!(hub.subscriber_count(), 1);
        drop(slow_rx);

        // Closing the hub ends the fast subscriber's stream; it must have
        // seen every event.
        hub.unsubscribe(_fast_id);
        let received = collector.await.unwrap();
        assert_eq!(received, TOTAL);
    }

    #[test]
    fn trade_ring_evicts_oldest() {
        let hub = EventHub::new(16, 3);
        for sym in ["A", "B", "C", "D"] {
            hub.record_trade(trade(sym));
        }
        let recent = hub.recent_trades(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].symbol, "B");
        assert_eq!(recent[2].symbol, "D");
    }

    #[test]
    fn recent_trades_limit() {
        let hub = EventHub::new(16, 10);
        for sym in ["A", "B", "C", "D"] {
            hub.record_trade(trade(sym));
        }
        let recent = hub.recent_trades(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].symbol, "C");
        assert_eq!(recent[1].symbol, "D");
    }
}

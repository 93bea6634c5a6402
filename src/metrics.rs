// =============================================================================
// Session Metrics — running totals for the trading session
// =============================================================================
//
// Updated by exactly one writer: the trade-event consumer task, which
// serialises every fill record emitted by the position tracker. Readers take
// immutable snapshots.
//
// Only closing trades (those carrying realized P&L) move the totals.
// trades/hour is an EWMA over irregular arrivals with a 15-minute half-life.
// =============================================================================

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::hub::EventHub;
use crate::journal::TradeJournal;
use crate::types::TradeRecord;

/// EWMA half-life for the trades/hour estimate, in minutes.
const RATE_HALF_LIFE_MIN: f64 = 15.0;

/// Immutable metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SessionMetrics {
    pub session_start: DateTime<Utc>,
    pub total_pnl: Decimal,
    pub wins: u32,
    pub losses: u32,
    /// Signed: positive while winning, negative while losing.
    pub current_streak: i32,
    pub best_streak: i32,
    pub trades_count: u32,
    pub trades_per_hour_ewma: f64,
}

impl SessionMetrics {
    fn new(session_start: DateTime<Utc>) -> Self {
        Self {
            session_start,
            total_pnl: Decimal::ZERO,
            wins: 0,
            losses: 0,
            current_streak: 0,
            best_streak: 0,
            trades_count: 0,
            trades_per_hour_ewma: 0.0,
        }
    }
}

pub struct MetricsAggregator {
    inner: RwLock<SessionMetrics>,
    last_trade_ts: RwLock<Option<DateTime<Utc>>>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(SessionMetrics::new(Utc::now())),
            last_trade_ts: RwLock::new(None),
        }
    }

    /// Apply one trade record. Opening fills leave the totals untouched;
    /// closing fills (realized P&L present) update everything.
    pub fn record(&self, record: &TradeRecord) {
        let Some(realized) = record.realized_pnl else {
            return;
        };

        let mut m = self.inner.write();
        m.total_pnl += realized;
        m.trades_count += 1;

        if realized > Decimal::ZERO {
            m.wins += 1;
            m.current_streak = if m.current_streak > 0 { m.current_streak + 1 } else { 1 };
            m.best_streak = m.best_streak.max(m.current_streak);
        } else if realized < Decimal::ZERO {
            m.losses += 1;
            m.current_streak = if m.current_streak < 0 { m.current_streak - 1 } else { -1 };
        }

        // --- trades/hour EWMA over irregular arrivals ----------------------
        let mut last = self.last_trade_ts.write();
        if let Some(prev) = *last {
            let dt_min = (record.ts - prev).num_milliseconds() as f64 / 60_000.0;
            if dt_min > 0.0 {
                let instant_rate = 60.0 / dt_min;
                let alpha = 1.0 - (-(dt_min) * std::f64::consts::LN_2 / RATE_HALF_LIFE_MIN).exp();
                m.trades_per_hour_ewma =
                    alpha * instant_rate + (1.0 - alpha) * m.trades_per_hour_ewma;
            }
        }
        *last = Some(record.ts);

        debug!(
            total_pnl = %m.total_pnl,
            wins = m.wins,
            losses = m.losses,
            streak = m.current_streak,
            "metrics updated"
        );
    }

    pub fn snapshot(&self) -> SessionMetrics {
        self.inner.read().clone()
    }

    /// Session realized loss so far (zero while profitable). The scheduler
    /// halts when this breaches the configured daily loss limit.
    pub fn session_loss(&self) -> Decimal {
        let total = self.inner.read().total_pnl;
        if total < Decimal::ZERO {
            -total
        } else {
            Decimal::ZERO
        }
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MetricsAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let m = self.snapshot();
        f.debug_struct("MetricsAggregator")
            .field("total_pnl", &m.total_pnl)
            .field("trades_count", &m.trades_count)
            .finish()
    }
}

// =============================================================================
// Trade-event consumer
// =============================================================================

/// The single writer for session metrics: consumes trade records in emission
/// order, updates the metrics, appends to the journal, and fans the record
/// out to clients.
pub async fn run_trade_consumer(
    mut rx: mpsc::UnboundedReceiver<TradeRecord>,
    metrics: std::sync::Arc<MetricsAggregator>,
    hub: std::sync::Arc<EventHub>,
    journal: std::sync::Arc<TradeJournal>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("trade consumer stopping");
                return;
            }
            record = rx.recv() => {
                let Some(record) = record else {
                    info!("trade channel closed — consumer stopping");
                    return;
                };
                metrics.record(&record);
                journal.append(&record);
                hub.record_trade(record);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderSide;
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn closing_trade(pnl: Decimal, ts: DateTime<Utc>) -> TradeRecord {
        TradeRecord {
            id: Uuid::new_v4().to_string(),
            symbol: "AAPL".to_string(),
            side: OrderSide::Sell,
            qty: dec!(10),
            price: dec!(100),
            value: dec!(1000),
            ts,
            realized_pnl: Some(pnl),
            realized_pnl_pct: Some(pnl / dec!(1000)),
            status: "closed".to_string(),
        }
    }

    fn opening_trade(ts: DateTime<Utc>) -> TradeRecord {
        TradeRecord {
            id: Uuid::new_v4().to_string(),
            symbol: "AAPL".to_string(),
            side: OrderSide::Buy,
            qty: dec!(10),
            price: dec!(100),
            value: dec!(1000),
            ts,
            realized_pnl: None,
            realized_pnl_pct: None,
            status: "open".to_string(),
        }
    }

    #[test]
    fn opening_trades_do_not_move_totals() {
        let agg = MetricsAggregator::new();
        agg.record(&opening_trade(Utc::now()));
        let m = agg.snapshot();
        assert_eq!(m.trades_count, 0);
        assert_eq!(m.total_pnl, Decimal::ZERO);
    }

    #[test]
    fn totals_sum_realized_pnl() {
        let agg = MetricsAggregator::new();
        let t0 = Utc::now();
        agg.record(&closing_trade(dec!(10.00), t0));
        agg.record(&closing_trade(dec!(-4.00), t0 + Duration::minutes(1)));
        agg.record(&closing_trade(dec!(6.50), t0 + Duration::minutes(2)));

        let m = agg.snapshot();
        assert_eq!(m.total_pnl, dec!(12.50));
        assert_eq!(m.trades_count, 3);
        assert_eq!(m.wins, 2);
        assert_eq!(m.losses, 1);
    }

    #[test]
    fn streaks_flip_sign() {
        let agg = MetricsAggregator::new();
        let t0 = Utc::now();
        let mut ts = t0;
        for pnl in [dec!(1), dec!(1), dec!(1), dec!(-1), dec!(-1), dec!(1)] {
            agg.record(&closing_trade(pnl, ts));
            ts += Duration::minutes(1);
        }

        let m = agg.snapshot();
        assert_eq!(m.best_streak, 3);
        assert_eq!(m.current_streak, 1);
        assert_eq!(m.wins, 4);
        assert_eq!(m.losses, 2);
    }

    #[test]
    fn breakeven_trade_counts_but_keeps_streak() {
        let agg = MetricsAggregator::new();
        let t0 = Utc::now();
        agg.record(&closing_trade(dec!(5), t0));
        agg.record(&closing_trade(Decimal::ZERO, t0 + Duration::minutes(1)));

        let m = agg.snapshot();
        assert_eq!(m.trades_count, 2);
        assert_eq!(m.wins, 1);
        assert_eq!(m.losses, 0);
        assert_eq!(m.current_streak, 1);
    }

    #[test]
    fn trade_rate_ewma_tracks_cadence() {
        let agg = MetricsAggregator::new();
        let t0 = Utc::now();
        // One trade per minute => instantaneous rate of 60/hour.
        let mut ts = t0;
        for _ in 0..20 {
            agg.record(&closing_trade(dec!(1), ts));
            ts += Duration::minutes(1);
        }
        let m = agg.snapshot();
        assert!(m.trades_per_hour_ewma > 20.0, "ewma {}", m.trades_per_hour_ewma);
        assert!(m.trades_per_hour_ewma <= 60.0 + 1e-9, "ewma {}", m.trades_per_hour_ewma);
    }

    #[test]
    fn session_loss_only_when_negative() {
        let agg = MetricsAggregator::new();
        let t0 = Utc::now();
        agg.record(&closing_trade(dec!(5), t0));
        assert_eq!(agg.session_loss(), Decimal::ZERO);
        agg.record(&closing_trade(dec!(-12), t0 + Duration::minutes(1)));
        assert_eq!(agg.session_loss(), dec!(7));
    }
}

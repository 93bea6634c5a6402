// =============================================================================
// Candle Buffer — bounded per-(symbol, timeframe) ring of OHLCV bars
// =============================================================================
//
// Append rules keep each ring strictly monotonic in time:
//   * newer timestamp  -> push, evict head when over capacity
//   * equal timestamp  -> replace last (late bar correction)
//   * older timestamp  -> drop
//
// Single writer (the market-data ingestor), many readers. Readers always get
// a consistent snapshot copy.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A single OHLCV bar. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub t: DateTime<Utc>,
    pub o: Decimal,
    pub h: Decimal,
    pub l: Decimal,
    pub c: Decimal,
    pub v: Decimal,
}

impl Candle {
    /// f64 views for the indicator kernel. Non-representable values map to
    /// NaN, which the indicators reject via their non-finite guards.
    pub fn open_f64(&self) -> f64 {
        self.o.to_f64().unwrap_or(f64::NAN)
    }

    pub fn high_f64(&self) -> f64 {
        self.h.to_f64().unwrap_or(f64::NAN)
    }

    pub fn low_f64(&self) -> f64 {
        self.l.to_f64().unwrap_or(f64::NAN)
    }

    pub fn close_f64(&self) -> f64 {
        self.c.to_f64().unwrap_or(f64::NAN)
    }

    pub fn volume_f64(&self) -> f64 {
        self.v.to_f64().unwrap_or(f64::NAN)
    }
}

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub timeframe: String,
}

impl CandleKey {
    pub fn new(symbol: impl Into<String>, timeframe: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe: timeframe.into(),
        }
    }
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

/// Thread-safe bounded ring buffer per `(symbol, timeframe)` pair.
pub struct CandleBuffer {
    buffers: RwLock<HashMap<CandleKey, VecDeque<Candle>>>,
    capacity: usize,
}

impl CandleBuffer {
    /// Create a buffer retaining at most `capacity` bars per key.
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Append a bar under the monotonicity rules. Returns `true` when the
    /// buffer changed (pushed or replaced), `false` when the bar was dropped
    /// as stale.
    pub fn append(&self, key: CandleKey, candle: Candle) -> bool {
        let mut map = self.buffers.write();
        let ring = map
            .entry(key)
            .or_insert_with(|| VecDeque::with_capacity(self.capacity));

        match ring.back() {
            Some(last) if candle.t < last.t => {
                debug!(t = %candle.t, last = %last.t, "stale bar dropped");
                false
            }
            Some(last) if candle.t == last.t => {
                // Late correction for the same bar — replace in place.
                ring.pop_back();
                ring.push_back(candle);
                true
            }
            _ => {
                ring.push_back(candle);
                while ring.len() > self.capacity {
                    ring.pop_front();
                }
                true
            }
        }
    }

    /// Seed a ring from REST history. Bars are appended oldest-first under
    /// the same monotonicity rules, so overlap with live data is harmless.
    pub fn seed(&self, key: &CandleKey, bars: Vec<Candle>) -> usize {
        let mut accepted = 0;
        for bar in bars {
            if self.append(key.clone(), bar) {
                accepted += 1;
            }
        }
        accepted
    }

    /// Full snapshot copy (oldest-first).
    pub fn snapshot(&self, key: &CandleKey) -> Vec<Candle> {
        let map = self.buffers.read();
        map.get(key)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The most recent `k` bars (oldest-first).
    pub fn last_n(&self, key: &CandleKey, k: usize) -> Vec<Candle> {
        let map = self.buffers.read();
        match map.get(key) {
            Some(ring) => {
                let start = ring.len().saturating_sub(k);
                ring.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Close price of the most recent bar, if any.
    pub fn latest_close(&self, key: &CandleKey) -> Option<Decimal> {
        let map = self.buffers.read();
        map.get(key).and_then(|ring| ring.back()).map(|c| c.c)
    }

    /// Number of bars stored for a key.
    pub fn len(&self, key: &CandleKey) -> usize {
        let map = self.buffers.read();
        map.get(key).map_or(0, VecDeque::len)
    }
}

impl std::fmt::Debug for CandleBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let map = self.buffers.read();
        f.debug_struct("CandleBuffer")
            .field("series", &map.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn bar(minute: i64, close: Decimal) -> Candle {
        Candle {
            t: Utc.timestamp_opt(1_700_000_000 + minute * 60, 0).unwrap(),
            o: close,
            h: close + dec!(1),
            l: close - dec!(1),
            c: close,
            v: dec!(100),
        }
    }

    fn key() -> CandleKey {
        CandleKey::new("BTCUSD", "1Min")
    }

    #[test]
    fn append_evicts_beyond_capacity() {
        let buf = CandleBuffer::new(3);
        for i in 0..5 {
            assert!(buf.append(key(), bar(i, Decimal::from(100 + i))));
        }
        assert_eq!(buf.len(&key()), 3);
        let snap = buf.snapshot(&key());
        assert_eq!(snap[0].c, dec!(102));
        assert_eq!(snap[2].c, dec!(104));
    }

    #[test]
    fn equal_timestamp_replaces_last() {
        let buf = CandleBuffer::new(10);
        buf.append(key(), bar(0, dec!(100)));
        buf.append(key(), bar(1, dec!(101)));
        assert!(buf.append(key(), bar(1, dec!(105))));
        assert_eq!(buf.len(&key()), 2);
        assert_eq!(buf.latest_close(&key()), Some(dec!(105)));
    }

    #[test]
    fn older_timestamp_is_dropped() {
        let buf = CandleBuffer::new(10);
        buf.append(key(), bar(5, dec!(100)));
        assert!(!buf.append(key(), bar(3, dec!(90))));
        assert_eq!(buf.len(&key()), 1);
        assert_eq!(buf.latest_close(&key()), Some(dec!(100)));
    }

    #[test]
    fn timestamps_strictly_monotonic_after_mixed_appends() {
        let buf = CandleBuffer::new(100);
        for i in [0, 2, 1, 3, 3, 2, 7] {
            buf.append(key(), bar(i, Decimal::from(100 + i)));
        }
        let snap = buf.snapshot(&key());
        for pair in snap.windows(2) {
            assert!(pair[0].t < pair[1].t, "timestamps must strictly increase");
        }
    }

    #[test]
    fn last_n_returns_tail() {
        let buf = CandleBuffer::new(10);
        for i in 0..6 {
            buf.append(key(), bar(i, Decimal::from(100 + i)));
        }
        let tail = buf.last_n(&key(), 2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].c, dec!(104));
        assert_eq!(tail[1].c, dec!(105));
    }

    #[test]
    fn unknown_key_is_empty() {
        let buf = CandleBuffer::new(10);
        assert!(buf.snapshot(&key()).is_empty());
        assert_eq!(buf.latest_close(&key()), None);
        assert_eq!(buf.len(&key()), 0);
    }

    #[test]
    fn seed_counts_accepted_bars() {
        let buf = CandleBuffer::new(10);
        buf.append(key(), bar(2, dec!(100)));
        // Bars 0 and 1 are older than the live bar and must be rejected.
        let accepted = buf.seed(&key(), vec![bar(0, dec!(98)), bar(1, dec!(99)), bar(3, dec!(101))]);
        assert_eq!(accepted, 1);
        assert_eq!(buf.len(&key()), 2);
    }
}

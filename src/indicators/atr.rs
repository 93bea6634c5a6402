// =============================================================================
// Average True Range (ATR) — Wilder's smoothing
// =============================================================================
//
// True Range per bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR_0 = SMA of the first `period` TR values
// ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
// =============================================================================

use crate::market_data::Candle;

/// Compute the full ATR series (one value per bar starting at `period`).
///
/// Returns an empty `Vec` when `period` is zero, there are fewer than
/// `period + 1` bars, or an intermediate value is non-finite.
pub fn atr_series(candles: &[Candle], period: usize) -> Vec<f64> {
    if period == 0 || candles.len() < period + 1 {
        return Vec::new();
    }

    let mut tr_values = Vec::with_capacity(candles.len() - 1);
    for pair in candles.windows(2) {
        let high = pair[1].high_f64();
        let low = pair[1].low_f64();
        let prev_close = pair[0].close_f64();

        let hl = high - low;
        let hc = (high - prev_close).abs();
        let lc = (low - prev_close).abs();
        tr_values.push(hl.max(hc).max(lc));
    }

    let seed: f64 = tr_values[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return Vec::new();
    }

    let period_f = period as f64;
    let mut result = Vec::with_capacity(tr_values.len() - period + 1);
    result.push(seed);

    let mut current = seed;
    for &tr in &tr_values[period..] {
        current = (current * (period_f - 1.0) + tr) / period_f;
        if !current.is_finite() {
            return Vec::new();
        }
        result.push(current);
    }

    result
}

/// The most recent ATR value.
pub fn atr(candles: &[Candle], period: usize) -> Option<f64> {
    atr_series(candles, period).last().copied()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use rust_decimal::prelude::FromPrimitive;

    fn candle(i: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
        let d = |x: f64| Decimal::from_f64(x).unwrap();
        Candle {
            t: Utc.timestamp_opt(1_700_000_000 + i * 60, 0).unwrap(),
            o: d(open),
            h: d(high),
            l: d(low),
            c: d(close),
            v: d(100.0),
        }
    }

    #[test]
    fn period_zero() {
        let candles: Vec<Candle> = (0..20).map(|i| candle(i, 100.0, 105.0, 95.0, 102.0)).collect();
        assert!(atr(&candles, 0).is_none());
    }

    #[test]
    fn insufficient_data() {
        let candles: Vec<Candle> = (0..10).map(|i| candle(i, 100.0, 105.0, 95.0, 102.0)).collect();
        assert!(atr(&candles, 14).is_none());
    }

    #[test]
    fn constant_range_converges() {
        // Every bar spans exactly 10 with close at the midpoint, so TR is
        // constant and ATR converges to 10.
        let candles: Vec<Candle> = (0..30)
            .map(|i| {
                let base = 100.0 + i as f64 * 0.1;
                candle(i, base, base + 5.0, base - 5.0, base)
            })
            .collect();
        let value = atr(&candles, 14).unwrap();
        assert!((value - 10.0).abs() < 1.0, "expected ATR near 10, got {value}");
    }

    #[test]
    fn gap_uses_prev_close() {
        let candles = vec![
            candle(0, 100.0, 105.0, 95.0, 95.0),
            // Gap up: |115 - 95| = 20 dominates H-L = 7.
            candle(1, 110.0, 115.0, 108.0, 112.0),
            candle(2, 112.0, 118.0, 110.0, 115.0),
            candle(3, 115.0, 120.0, 113.0, 118.0),
        ];
        let value = atr(&candles, 3).unwrap();
        assert!(value > 7.0, "ATR should reflect the gap, got {value}");
    }

    #[test]
    fn series_length_matches() {
        let candles: Vec<Candle> = (0..50)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.5).sin() * 10.0;
                candle(i, base - 0.5, base + 2.0, base - 2.0, base + 0.5)
            })
            .collect();
        let series = atr_series(&candles, 14);
        // 49 TR values, seeded at 14 -> 36 outputs.
        assert_eq!(series.len(), 36);
        for &v in &series {
            assert!(v > 0.0 && v.is_finite());
        }
    }

    #[test]
    fn latest_matches_series_tail() {
        let candles: Vec<Candle> = (0..40)
            .map(|i| {
                let base = 100.0 + i as f64;
                candle(i, base, base + 3.0, base - 3.0, base + 1.0)
            })
            .collect();
        assert_eq!(atr(&candles, 14), atr_series(&candles, 14).last().copied());
    }
}

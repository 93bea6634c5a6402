// =============================================================================
// Stochastic RSI — momentum oscillator bounded in [0, 100]
// =============================================================================
//
// Pipeline:
//   1. RSI series over `rsi_period`.
//   2. raw_t = (rsi_t - min(window)) / (max(window) - min(window)) over the
//      trailing `stoch_period` window. A flat window (max == min) yields 0.5
//      rather than NaN.
//   3. %K = SMA(raw, k_smooth) * 100
//   4. %D = SMA(%K, d_smooth)
// =============================================================================

use super::rsi::rsi;

/// Aligned %K / %D series. The last element of each is the current value;
/// `d` is shorter than `k` by `d_smooth - 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct StochRsi {
    pub k: Vec<f64>,
    pub d: Vec<f64>,
}

impl StochRsi {
    /// Current and previous (%K, %D) pairs, aligned on the same bars.
    /// Returns `None` until two %D values exist.
    pub fn last_two(&self) -> Option<((f64, f64), (f64, f64))> {
        if self.d.len() < 2 || self.k.len() < 2 {
            return None;
        }
        let k_cur = *self.k.last()?;
        let k_prev = self.k[self.k.len() - 2];
        let d_cur = *self.d.last()?;
        let d_prev = self.d[self.d.len() - 2];
        Some(((k_prev, d_prev), (k_cur, d_cur)))
    }
}

/// Compute the StochRSI %K / %D series.
///
/// Returns `None` when the input cannot produce at least one %D value.
pub fn stoch_rsi(
    values: &[f64],
    rsi_period: usize,
    stoch_period: usize,
    k_smooth: usize,
    d_smooth: usize,
) -> Option<StochRsi> {
    if stoch_period == 0 || k_smooth == 0 || d_smooth == 0 {
        return None;
    }

    let rsi_series = rsi(values, rsi_period);
    if rsi_series.len() < stoch_period {
        return None;
    }

    // --- Raw stochastic of the RSI series --------------------------------
    let mut raw = Vec::with_capacity(rsi_series.len() - stoch_period + 1);
    for window in rsi_series.windows(stoch_period) {
        let min = window.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = window.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let range = max - min;
        let current = window[window.len() - 1];

        let value = if range == 0.0 {
            // Flat window: centre of the band, never NaN.
            0.5
        } else {
            (current - min) / range
        };
        if !value.is_finite() {
            return None;
        }
        raw.push(value);
    }

    // --- Smooth into %K and %D --------------------------------------------
    let k: Vec<f64> = sma_series(&raw, k_smooth)
        .into_iter()
        .map(|v| v * 100.0)
        .collect();
    if k.is_empty() {
        return None;
    }

    let d = sma_series(&k, d_smooth);
    if d.is_empty() {
        return None;
    }

    Some(StochRsi { k, d })
}

/// Trailing simple moving average, one output per full window.
fn sma_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }
    values
        .windows(period)
        .map(|w| w.iter().sum::<f64>() / period as f64)
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn wavy(n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| 100.0 + (i as f64 * 0.5).sin() * 8.0 + (i as f64 * 0.13).cos() * 3.0)
            .collect()
    }

    #[test]
    fn too_short_returns_none() {
        assert!(stoch_rsi(&wavy(10), 14, 14, 3, 3).is_none());
    }

    #[test]
    fn zero_parameters_return_none() {
        let values = wavy(100);
        assert!(stoch_rsi(&values, 14, 0, 3, 3).is_none());
        assert!(stoch_rsi(&values, 14, 14, 0, 3).is_none());
        assert!(stoch_rsi(&values, 14, 14, 3, 0).is_none());
    }

    #[test]
    fn flat_window_yields_half() {
        // A flat series keeps RSI pinned at 50, so every stochastic window is
        // flat and raw = 0.5, %K = 50.
        let values = vec![100.0; 80];
        let out = stoch_rsi(&values, 14, 14, 3, 3).unwrap();
        for &k in &out.k {
            assert!((k - 50.0).abs() < 1e-10, "expected 50, got {k}");
        }
        for &d in &out.d {
            assert!((d - 50.0).abs() < 1e-10, "expected 50, got {d}");
        }
    }

    #[test]
    fn values_bounded_to_percent_range() {
        let out = stoch_rsi(&wavy(200), 14, 14, 3, 3).unwrap();
        for &k in &out.k {
            assert!((0.0..=100.0).contains(&k), "%K {k} out of range");
        }
        for &d in &out.d {
            assert!((0.0..=100.0).contains(&d), "%D {d} out of range");
        }
    }

    #[test]
    fn deterministic_re_evaluation() {
        let values = wavy(150);
        let a = stoch_rsi(&values, 14, 14, 3, 3).unwrap();
        let b = stoch_rsi(&values, 14, 14, 3, 3).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn last_two_alignment() {
        let out = stoch_rsi(&wavy(200), 14, 14, 3, 3).unwrap();
        let ((k_prev, d_prev), (k_cur, d_cur)) = out.last_two().unwrap();
        assert_eq!(k_cur, *out.k.last().unwrap());
        assert_eq!(d_cur, *out.d.last().unwrap());
        assert_eq!(k_prev, out.k[out.k.len() - 2]);
        assert_eq!(d_prev, out.d[out.d.len() - 2]);
    }

    #[test]
    fn d_lags_k_by_smoothing() {
        let out = stoch_rsi(&wavy(200), 14, 14, 3, 3).unwrap();
        assert_eq!(out.d.len(), out.k.len() - 2);
    }
}

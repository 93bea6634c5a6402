// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// Formula:
//   alpha = 2 / (period + 1)
//   EMA_t = x_t * alpha + EMA_{t-1} * (1 - alpha)
//
// The first EMA value is seeded with the SMA of the first `period` inputs.
// =============================================================================

/// Compute the EMA series for `values` with look-back `period`.
///
/// Returns an empty `Vec` when the input is too short or the period is zero.
/// Each output element corresponds to an input starting at index `period - 1`.
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }

    let alpha = 2.0 / (period + 1) as f64;

    let sma: f64 = values[..period].iter().sum::<f64>() / period as f64;
    if !sma.is_finite() {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(values.len() - period + 1);
    result.push(sma);

    let mut prev = sma;
    for &x in &values[period..] {
        let next = x * alpha + prev * (1.0 - alpha);
        if !next.is_finite() {
            // A broken series must not keep producing values.
            break;
        }
        result.push(next);
        prev = next;
    }

    result
}

/// Slope of the EMA over the last `k` outputs: `ema_last - ema_{last-k}`.
///
/// Returns `None` when the series is shorter than `k + 1`.
pub fn ema_slope(series: &[f64], k: usize) -> Option<f64> {
    if k == 0 || series.len() < k + 1 {
        return None;
    }
    let last = *series.last()?;
    let earlier = series[series.len() - 1 - k];
    let slope = last - earlier;
    slope.is_finite().then_some(slope)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input() {
        assert!(ema(&[], 5).is_empty());
    }

    #[test]
    fn period_zero() {
        assert!(ema(&[1.0, 2.0, 3.0], 0).is_empty());
    }

    #[test]
    fn insufficient_data() {
        assert!(ema(&[1.0, 2.0], 5).is_empty());
    }

    #[test]
    fn period_equals_length_yields_sma() {
        let out = ema(&[2.0, 4.0, 6.0], 3);
        assert_eq!(out.len(), 1);
        assert!((out[0] - 4.0).abs() < 1e-12);
    }

    #[test]
    fn known_values() {
        // 5-period EMA of 1..=10: seed SMA = 3.0, alpha = 1/3.
        let values: Vec<f64> = (1..=10).map(|x| x as f64).collect();
        let out = ema(&values, 5);
        assert_eq!(out.len(), 6);

        let alpha = 2.0 / 6.0;
        let mut expected = 3.0;
        let mut expected_series = vec![expected];
        for &x in &values[5..] {
            expected = x * alpha + expected * (1.0 - alpha);
            expected_series.push(expected);
        }
        for (a, b) in out.iter().zip(expected_series.iter()) {
            assert!((a - b).abs() < 1e-12, "got {a}, expected {b}");
        }
    }

    #[test]
    fn re_evaluation_is_identical() {
        let values: Vec<f64> = (0..60).map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0).collect();
        let a = ema(&values, 9);
        let b = ema(&values, 9);
        assert_eq!(a, b);
    }

    #[test]
    fn nan_in_input_truncates_series() {
        let values = vec![1.0, 2.0, 3.0, f64::NAN, 5.0];
        let out = ema(&values, 3);
        // Seed survives; the NaN input stops further output.
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn slope_of_rising_series_is_positive() {
        let values: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        let series = ema(&values, 3);
        let slope = ema_slope(&series, 3).unwrap();
        assert!(slope > 0.0);
    }

    #[test]
    fn slope_requires_enough_points() {
        assert!(ema_slope(&[1.0, 2.0], 3).is_none());
        assert!(ema_slope(&[1.0, 2.0, 3.0], 0).is_none());
    }
}

// =============================================================================
// Relative Strength Index (RSI) — Wilder's smoothing
// =============================================================================
//
// Average gain and loss are seeded over the first `period` price moves, then
// updated incrementally per bar:
//
//   avg += (x - avg) / period
//
// which is Wilder's recurrence in update form. RSI itself is expressed as
// 100 * avg_gain / (avg_gain + avg_loss), algebraically the same as
// 100 - 100 / (1 + RS) without the intermediate ratio.
// =============================================================================

/// Compute the RSI series for `values` and `period` in a single pass.
///
/// One output per input starting at index `period` (the first `period` moves
/// seed the averages). Empty when `period` is zero or the input is too
/// short. A flat window reads 50, an all-gain window 100, an all-loss
/// window 0.
pub fn rsi(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() <= period {
        return Vec::new();
    }

    let inv_period = 1.0 / period as f64;
    let mut result = Vec::with_capacity(values.len() - period);
    let mut avg_gain = 0.0_f64;
    let mut avg_loss = 0.0_f64;

    for (i, pair) in values.windows(2).enumerate() {
        let delta = pair[1] - pair[0];
        if !delta.is_finite() {
            // A poisoned input (NaN) must not keep producing values.
            break;
        }
        let (gain, loss) = if delta >= 0.0 { (delta, 0.0) } else { (0.0, -delta) };

        if i < period {
            // Seed phase: plain average of the first `period` moves.
            avg_gain += gain * inv_period;
            avg_loss += loss * inv_period;
            if i + 1 < period {
                continue;
            }
        } else {
            avg_gain += (gain - avg_gain) * inv_period;
            avg_loss += (loss - avg_loss) * inv_period;
        }

        let value = match (avg_gain > 0.0, avg_loss > 0.0) {
            // No movement inside the window at all.
            (false, false) => 50.0,
            (true, false) => 100.0,
            _ => 100.0 * avg_gain / (avg_gain + avg_loss),
        };
        if !value.is_finite() {
            break;
        }
        result.push(value);
    }

    result
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> Vec<f64> {
        (1..=n).map(|x| x as f64).collect()
    }

    #[test]
    fn degenerate_inputs_yield_nothing() {
        assert!(rsi(&[], 14).is_empty());
        assert!(rsi(&ramp(3), 0).is_empty());
        // period + 1 values are the minimum; exactly `period` is not enough.
        assert!(rsi(&ramp(14), 14).is_empty());
        assert_eq!(rsi(&ramp(15), 14).len(), 1);
    }

    #[test]
    fn output_length_tracks_input() {
        assert_eq!(rsi(&ramp(30), 14).len(), 16);
        assert_eq!(rsi(&ramp(100), 5).len(), 95);
    }

    #[test]
    fn monotonic_series_pin_the_extremes() {
        for v in rsi(&ramp(30), 14) {
            assert!((v - 100.0).abs() < 1e-10, "rising series must read 100, got {v}");
        }

        let falling: Vec<f64> = ramp(30).into_iter().rev().collect();
        for v in rsi(&falling, 14) {
            assert!(v.abs() < 1e-10, "falling series must read 0, got {v}");
        }
    }

    #[test]
    fn flat_series_reads_neutral() {
        for v in rsi(&[100.0; 30], 14) {
            assert!((v - 50.0).abs() < 1e-10, "flat series must read 50, got {v}");
        }
    }

    #[test]
    fn one_drop_after_a_rally_decays_gradually() {
        // Wilder smoothing: a single down move dents a long rally's RSI but
        // cannot drag it anywhere near neutral.
        let mut values = ramp(40);
        values.push(39.5);
        let last = *rsi(&values, 14).last().unwrap();
        assert!(last < 100.0, "one loss must pull RSI off the ceiling, got {last}");
        assert!(last > 80.0, "one loss must not crater a long rally, got {last}");
    }

    #[test]
    fn bounded_for_arbitrary_data() {
        let values = vec![
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
            44.18, 44.22, 44.57, 43.42, 42.66, 43.13,
        ];
        for v in rsi(&values, 14) {
            assert!((0.0..=100.0).contains(&v), "RSI {v} out of range");
        }
    }

    #[test]
    fn nan_truncates_the_series() {
        let values = vec![1.0, 2.0, 3.0, 4.0, f64::NAN, 6.0, 7.0];
        let out = rsi(&values, 3);
        // The first value (from the clean seed window) survives; the NaN
        // delta stops everything after it.
        assert_eq!(out.len(), 1);
    }
}

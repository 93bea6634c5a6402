// =============================================================================
// StochRSI + EMA confluence strategy with volume confirmation
// =============================================================================
//
// Entry (buy) requires all of:
//   * %K crosses above %D        (K_prev <= D_prev and K_now > D_now)
//   * %K below the oversold gate
//   * fast EMA above slow EMA    (trend confirmation)
//   * volume >= ratio * vol SMA  (when the volume filter is enabled)
//
// Exit (sell) requires:
//   * %K crosses below %D
//   * %K above the overbought gate
//
// Strength starts at 0.5 and earns bonuses for volume expansion and EMA
// slope agreement, clamped to [0, 1].
//
// Dynamic bands (off by default): the gates move by sensitivity *
// (volatility_ratio - 1) * 10, where volatility_ratio is current ATR over
// its mean across the baseline window. The adjusted oversold gate is clamped
// to [10, 30] and the overbought gate to [70, 90].
// =============================================================================

use tracing::debug;

use crate::config::StrategyConfig;
use crate::indicators::atr::atr_series;
use crate::indicators::ema::{ema, ema_slope};
use crate::indicators::stoch_rsi::stoch_rsi;
use crate::indicators::volume::volume_ratio;
use crate::market_data::Candle;
use crate::types::{Signal, SignalAction};

use super::Strategy;

/// ATR look-back for the volatility ratio.
const ATR_PERIOD: usize = 14;
/// Volume SMA look-back for the confirmation filter.
const VOLUME_SMA_PERIOD: usize = 20;
/// Bars over which the EMA slope bonus is measured.
const SLOPE_BARS: usize = 3;

const OVERSOLD_CLAMP: (f64, f64) = (10.0, 30.0);
const OVERBOUGHT_CLAMP: (f64, f64) = (70.0, 90.0);

#[derive(Debug, Default)]
pub struct StochRsiEmaStrategy;

impl Strategy for StochRsiEmaStrategy {
    fn name(&self) -> &'static str {
        "stoch-rsi-ema"
    }

    fn evaluate(&self, symbol: &str, candles: &[Candle], cfg: &StrategyConfig) -> Signal {
        let closes: Vec<f64> = candles.iter().map(Candle::close_f64).collect();
        let volumes: Vec<f64> = candles.iter().map(Candle::volume_f64).collect();

        // --- Oscillator -----------------------------------------------------
        let Some(stoch) = stoch_rsi(
            &closes,
            cfg.stoch.rsi_period,
            cfg.stoch.stoch_period,
            cfg.stoch.k_smooth,
            cfg.stoch.d_smooth,
        ) else {
            return Signal::hold(symbol, "insufficient data for stoch rsi");
        };
        let Some(((k_prev, d_prev), (k_now, d_now))) = stoch.last_two() else {
            return Signal::hold(symbol, "insufficient stoch rsi history");
        };

        // --- Trend ----------------------------------------------------------
        let fast_series = ema(&closes, cfg.ema.fast);
        let slow_series = ema(&closes, cfg.ema.slow);
        let (Some(&ema_fast), Some(&ema_slow)) = (fast_series.last(), slow_series.last()) else {
            return Signal::hold(symbol, "insufficient data for emas");
        };

        // --- Gates, optionally widened by volatility ------------------------
        let (oversold_gate, overbought_gate) = self.gates(candles, cfg);

        // --- Volume confirmation --------------------------------------------
        let vol_ratio = volume_ratio(&volumes, VOLUME_SMA_PERIOD);
        let volume_ok = if cfg.volume.enabled {
            vol_ratio.is_some_and(|r| r >= cfg.volume.ratio)
        } else {
            true
        };

        let crossed_up = k_prev <= d_prev && k_now > d_now;
        let crossed_down = k_prev >= d_prev && k_now < d_now;

        if crossed_up && k_now < oversold_gate && ema_fast > ema_slow && volume_ok {
            let strength = self.strength(vol_ratio, ema_slope(&fast_series, SLOPE_BARS), true);
            debug!(
                symbol,
                k = k_now,
                d = d_now,
                gate = oversold_gate,
                strength,
                "buy confluence"
            );
            return Signal {
                symbol: symbol.to_string(),
                action: SignalAction::Buy,
                strength,
                reason: format!(
                    "stoch cross up (k {k_now:.1} > d {d_now:.1}) below {oversold_gate:.0}, ema trend up"
                ),
                ts: chrono::Utc::now(),
            };
        }

        if crossed_down && k_now > overbought_gate {
            let strength = self.strength(vol_ratio, ema_slope(&fast_series, SLOPE_BARS), false);
            debug!(
                symbol,
                k = k_now,
                d = d_now,
                gate = overbought_gate,
                strength,
                "sell cross"
            );
            return Signal {
                symbol: symbol.to_string(),
                action: SignalAction::Sell,
                strength,
                reason: format!(
                    "stoch cross down (k {k_now:.1} < d {d_now:.1}) above {overbought_gate:.0}"
                ),
                ts: chrono::Utc::now(),
            };
        }

        Signal::hold(symbol, format!("no confluence (k {k_now:.1}, d {d_now:.1})"))
    }
}

impl StochRsiEmaStrategy {
    /// The oversold/overbought gates for this snapshot. Static config values
    /// unless dynamic bands are enabled, in which case the gates move with
    /// the ATR volatility ratio and clamp to their bands.
    fn gates(&self, candles: &[Candle], cfg: &StrategyConfig) -> (f64, f64) {
        let base = (cfg.stoch.oversold_upper, cfg.stoch.overbought_lower);
        if !cfg.dynamic_bands.enabled {
            return base;
        }

        let series = atr_series(candles, ATR_PERIOD);
        if series.is_empty() {
            return base;
        }
        let window = cfg.dynamic_bands.base_volatility_window.max(1);
        let start = series.len().saturating_sub(window);
        let baseline: f64 = series[start..].iter().sum::<f64>() / (series.len() - start) as f64;
        let current = series[series.len() - 1];
        if baseline <= 0.0 || !baseline.is_finite() || !current.is_finite() {
            return base;
        }

        let ratio = current / baseline;
        let delta = cfg.dynamic_bands.sensitivity * (ratio - 1.0) * 10.0;

        let oversold = (base.0 - delta).clamp(OVERSOLD_CLAMP.0, OVERSOLD_CLAMP.1);
        let overbought = (base.1 + delta).clamp(OVERBOUGHT_CLAMP.0, OVERBOUGHT_CLAMP.1);
        (oversold, overbought)
    }

    /// Strength scoring: base 0.5, volume bonus (+0.2 at 1.5x, +0.1 at 1.2x),
    /// EMA-slope agreement bonus (+0.2), clamped to [0, 1].
    fn strength(&self, vol_ratio: Option<f64>, slope: Option<f64>, is_buy: bool) -> f64 {
        let mut strength: f64 = 0.5;

        if let Some(ratio) = vol_ratio {
            if ratio >= 1.5 {
                strength += 0.2;
            } else if ratio >= 1.2 {
                strength += 0.1;
            }
        }

        if let Some(slope) = slope {
            let agrees = if is_buy { slope > 0.0 } else { slope < 0.0 };
            if agrees {
                strength += 0.2;
            }
        }

        strength.clamp(0.0, 1.0)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrategyConfig;
    use chrono::{TimeZone, Utc};
    use rust_decimal::prelude::FromPrimitive;
    use rust_decimal::Decimal;

    fn candle(i: i64, close: f64, volume: f64) -> Candle {
        let d = |x: f64| Decimal::from_f64(x).unwrap();
        Candle {
            t: Utc.timestamp_opt(1_700_000_000 + i * 60, 0).unwrap(),
            o: d(close),
            h: d(close + 0.5),
            l: d(close - 0.5),
            c: d(close),
            v: d(volume),
        }
    }

    /// Long decline with sparse counter-ticks (so the RSI window is never
    /// flat), tailing off into fresh RSI lows, then one strong up-bar: %K
    /// jumps off the floor and crosses above %D while the 3-bar smoothing
    /// still holds it under the oversold gate, and the bar is big enough to
    /// flip the fast EMA over the slow one.
    fn buy_setup() -> Vec<Candle> {
        let mut candles = Vec::new();
        let mut price = 130.0;
        for i in 0..60 {
            if i % 20 == 4 {
                price += 0.2;
            } else {
                price -= 1.0;
            }
            candles.push(candle(i, price, 100.0));
        }
        // price is now 73.6; jump with twice the baseline volume.
        candles.push(candle(60, 86.0, 200.0));
        candles
    }

    /// Mirror image: a rally with sparse dips, RSI grinding to fresh highs,
    /// then one sharp down-bar crossing %K below %D above the overbought
    /// gate.
    fn sell_setup() -> Vec<Candle> {
        let mut candles = Vec::new();
        let mut price = 70.0;
        for i in 0..60 {
            if i % 20 == 4 {
                price -= 0.2;
            } else {
                price += 1.0;
            }
            candles.push(candle(i, price, 100.0));
        }
        // price is now 126.4; crash.
        candles.push(candle(60, 114.0, 150.0));
        candles
    }

    #[test]
    fn buy_confluence_fires() {
        let strategy = StochRsiEmaStrategy;
        let cfg = StrategyConfig::default();
        let signal = strategy.evaluate("AAPL", &buy_setup(), &cfg);
        assert_eq!(signal.action, SignalAction::Buy, "reason: {}", signal.reason);
        assert!(signal.strength >= 0.7, "strength {}", signal.strength);
    }

    #[test]
    fn sell_cross_fires() {
        let strategy = StochRsiEmaStrategy;
        let cfg = StrategyConfig::default();
        let signal = strategy.evaluate("AAPL", &sell_setup(), &cfg);
        assert_eq!(signal.action, SignalAction::Sell, "reason: {}", signal.reason);
    }

    #[test]
    fn insufficient_data_holds() {
        let strategy = StochRsiEmaStrategy;
        let cfg = StrategyConfig::default();
        let candles: Vec<Candle> = (0..10).map(|i| candle(i, 100.0, 50.0)).collect();
        let signal = strategy.evaluate("AAPL", &candles, &cfg);
        assert_eq!(signal.action, SignalAction::Hold);
    }

    #[test]
    fn flat_series_holds() {
        let strategy = StochRsiEmaStrategy;
        let cfg = StrategyConfig::default();
        let candles: Vec<Candle> = (0..80).map(|i| candle(i, 100.0, 50.0)).collect();
        let signal = strategy.evaluate("AAPL", &candles, &cfg);
        assert_eq!(signal.action, SignalAction::Hold);
    }

    #[test]
    fn volume_filter_blocks_quiet_entries() {
        let strategy = StochRsiEmaStrategy;
        let mut cfg = StrategyConfig::default();
        cfg.volume.ratio = 1.2;

        // Same shape as buy_setup but the final bar has baseline volume.
        let mut candles = buy_setup();
        let last = candles.last_mut().unwrap();
        last.v = Decimal::from(100);

        let signal = strategy.evaluate("AAPL", &candles, &cfg);
        assert_eq!(signal.action, SignalAction::Hold, "reason: {}", signal.reason);

        // Disabling the filter lets the same snapshot through.
        cfg.volume.enabled = false;
        let signal = strategy.evaluate("AAPL", &candles, &cfg);
        assert_eq!(signal.action, SignalAction::Buy);
    }

    #[test]
    fn evaluation_is_deterministic() {
        let strategy = StochRsiEmaStrategy;
        let cfg = StrategyConfig::default();
        let candles = buy_setup();
        let a = strategy.evaluate("AAPL", &candles, &cfg);
        let b = strategy.evaluate("AAPL", &candles, &cfg);
        assert_eq!(a.action, b.action);
        assert!((a.strength - b.strength).abs() < 1e-12);
        assert_eq!(a.reason, b.reason);
    }

    #[test]
    fn dynamic_bands_move_with_volatility() {
        let strategy = StochRsiEmaStrategy;
        let mut cfg = StrategyConfig::default();
        cfg.dynamic_bands.enabled = true;
        cfg.dynamic_bands.sensitivity = 0.5;
        cfg.dynamic_bands.base_volatility_window = 50;

        // Calm series, then violently expanding ranges at the tail.
        let d = |x: f64| Decimal::from_f64(x).unwrap();
        let mut candles: Vec<Candle> = (0..80).map(|i| candle(i, 100.0, 50.0)).collect();
        for i in 0..10 {
            let spread = 5.0 + i as f64;
            let base = 100.0;
            candles.push(Candle {
                t: Utc.timestamp_opt(1_700_000_000 + (80 + i) * 60, 0).unwrap(),
                o: d(base),
                h: d(base + spread),
                l: d(base - spread),
                c: d(base),
                v: d(50.0),
            });
        }

        let (oversold, overbought) = strategy.gates(&candles, &cfg);
        // High current volatility vs baseline: oversold tightens down,
        // overbought up, both inside their clamp bands.
        assert!(oversold < 30.0, "oversold gate {oversold}");
        assert!((10.0..=30.0).contains(&oversold));
        assert!(overbought > 70.0, "overbought gate {overbought}");
        assert!((70.0..=90.0).contains(&overbought));
    }

    #[test]
    fn dynamic_bands_disabled_uses_static_gates() {
        let strategy = StochRsiEmaStrategy;
        let cfg = StrategyConfig::default();
        let candles = buy_setup();
        let (oversold, overbought) = strategy.gates(&candles, &cfg);
        assert_eq!(oversold, 35.0);
        assert_eq!(overbought, 65.0);
    }
}

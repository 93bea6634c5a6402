// =============================================================================
// Strategy Module — signal evaluators behind a common seam
// =============================================================================
//
// A strategy is a pure function of the candle snapshot and its config: no
// clocks, no IO, no hidden state. The scheduler owns a boxed strategy per
// market mode and dispatches through the trait.
// =============================================================================

pub mod stoch_rsi_ema;

pub use stoch_rsi_ema::StochRsiEmaStrategy;

use crate::config::StrategyConfig;
use crate::market_data::Candle;
use crate::types::Signal;

pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Evaluate one symbol from a candle snapshot. Deterministic for a given
    /// `(candles, cfg)` pair apart from the signal timestamp.
    fn evaluate(&self, symbol: &str, candles: &[Candle], cfg: &StrategyConfig) -> Signal;
}

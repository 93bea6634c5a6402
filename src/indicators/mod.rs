// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators used by the
// signal evaluator. Every public function returns `Option<T>` or an empty
// series so callers are forced to handle insufficient-data and numerical
// edge cases.

pub mod atr;
pub mod ema;
pub mod rsi;
pub mod stoch_rsi;
pub mod volume;

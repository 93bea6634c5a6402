// =============================================================================
// Market Data Module
// =============================================================================

pub mod candle_buffer;

pub use candle_buffer::{Candle, CandleBuffer, CandleKey};

// =============================================================================
// Symbol forms — canonical internally, broker-specific at the wire
// =============================================================================
//
// The engine works exclusively with canonical symbols (separators stripped,
// upper-case): `BTCUSD`, `AAPL`. The broker wants crypto pairs with a slash
// (`BTC/USD`) and equities plain. This module is the only place that knows
// about the broker form.
// =============================================================================

use crate::types::MarketMode;

/// Quote currencies recognised when re-inserting the crypto pair separator.
const QUOTE_CURRENCIES: &[&str] = &["USDT", "USDC", "USD", "BTC", "ETH"];

/// Normalise any client- or broker-supplied symbol to canonical form.
pub fn canonical(symbol: &str) -> String {
    symbol
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Render a canonical symbol in the form the broker expects for `mode`.
///
/// Equities pass through unchanged. Crypto pairs get the separator before
/// the longest recognised quote-currency suffix; unrecognised pairs pass
/// through unchanged and the broker rejects them as invalid.
pub fn broker_form(canonical: &str, mode: MarketMode) -> String {
    match mode {
        MarketMode::Equities => canonical.to_string(),
        MarketMode::Crypto => {
            for quote in QUOTE_CURRENCIES {
                if let Some(base) = canonical.strip_suffix(quote) {
                    if !base.is_empty() {
                        return format!("{base}/{quote}");
                    }
                }
            }
            canonical.to_string()
        }
    }
}

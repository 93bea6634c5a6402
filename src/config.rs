// =============================================================================
// Runtime Configuration — hot-reloadable engine settings with atomic save
// =============================================================================
//
// Every tunable parameter lives here so the engine can be reconfigured
// without a rebuild. Persistence uses an atomic tmp + rename pattern, and all
// fields carry `#[serde(default)]` so adding new fields never breaks loading
// an older config file.
//
// After loading, `apply_env_overrides` applies `TRADING_<SECTION>_<KEY>`
// environment variables on top (e.g. `TRADING_ORDER_COOLDOWN_SECONDS=45`).
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_crypto_tick_ms() -> u64 {
    1500
}

fn default_equities_tick_ms() -> u64 {
    10_000
}

fn default_crypto_symbols() -> Vec<String> {
    vec!["BTCUSD".to_string(), "ETHUSD".to_string(), "SOLUSD".to_string()]
}

fn default_equities_symbols() -> Vec<String> {
    vec!["AAPL".to_string(), "MSFT".to_string(), "SPY".to_string()]
}

fn default_threshold_crypto() -> f64 {
    0.70
}

fn default_threshold_stocks() -> f64 {
    0.75
}

fn default_cooldown_seconds() -> u64 {
    30
}

fn default_order_timeout_seconds() -> u64 {
    60
}

fn default_max_retries_transient() -> u32 {
    3
}

fn default_max_concurrent() -> u32 {
    5
}

fn default_size_pct_equity() -> f64 {
    0.005
}

fn default_buffer_size() -> usize {
    500
}

fn default_timeframe() -> String {
    "1Min".to_string()
}

fn default_rsi_period() -> usize {
    14
}

fn default_stoch_period() -> usize {
    14
}

fn default_smooth() -> usize {
    3
}

fn default_oversold_upper() -> f64 {
    35.0
}

fn default_overbought_lower() -> f64 {
    65.0
}

fn default_ema_fast() -> usize {
    3
}

fn default_ema_slow() -> usize {
    8
}

fn default_true() -> bool {
    true
}

fn default_volume_ratio() -> f64 {
    1.2
}

fn default_bands_sensitivity() -> f64 {
    0.5
}

fn default_base_volatility_window() -> usize {
    100
}

fn default_outbox_size() -> usize {
    256
}

fn default_recent_trades() -> usize {
    500
}

fn default_shutdown_grace_seconds() -> u64 {
    10
}

fn default_rate_limit_per_min() -> u32 {
    200
}

// =============================================================================
// Sections
// =============================================================================

/// Per-market-mode scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeConfig {
    /// Scheduler tick period in milliseconds.
    pub tick_interval_ms: u64,
    /// Watchlist symbols in canonical form (no separators).
    pub symbols: Vec<String>,
    /// Whether the loop acts on signals. Toggled at runtime via the API;
    /// starts disabled so a restart never trades unattended.
    #[serde(default)]
    pub enabled: bool,
}

/// Minimum signal strength required to act, per market mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalThresholds {
    #[serde(default = "default_threshold_crypto")]
    pub crypto: f64,
    #[serde(default = "default_threshold_stocks")]
    pub stocks: f64,
}

impl Default for SignalThresholds {
    fn default() -> Self {
        Self {
            crypto: default_threshold_crypto(),
            stocks: default_threshold_stocks(),
        }
    }
}

impl SignalThresholds {
    pub fn for_mode(&self, mode: crate::types::MarketMode) -> f64 {
        match mode {
            crate::types::MarketMode::Crypto => self.crypto,
            crate::types::MarketMode::Equities => self.stocks,
        }
    }
}

/// Order manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderConfig {
    /// Per-(symbol, side) dedup window in seconds.
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    /// Unfilled orders older than this are cancelled.
    #[serde(default = "default_order_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Retry count for idempotent GETs.
    #[serde(default = "default_max_retries_transient")]
    pub max_retries_transient: u32,
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            cooldown_seconds: default_cooldown_seconds(),
            timeout_seconds: default_order_timeout_seconds(),
            max_retries_transient: default_max_retries_transient(),
        }
    }
}

/// Position sizing and caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionConfig {
    /// Maximum concurrently held positions across all symbols.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    /// Notional per trade as a fraction of account equity.
    #[serde(default = "default_size_pct_equity")]
    pub size_pct_equity: f64,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            size_pct_equity: default_size_pct_equity(),
        }
    }
}

/// Session risk limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Halts both scheduler loops when session realized loss breaches this
    /// (absolute account-currency amount). `None` disables the check.
    #[serde(default)]
    pub daily_loss_limit: Option<Decimal>,
}

/// Candle buffer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandleConfig {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Bar timeframe requested from the broker (history seed and stream).
    #[serde(default = "default_timeframe")]
    pub timeframe: String,
}

impl Default for CandleConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            timeframe: default_timeframe(),
        }
    }
}

/// StochRSI oscillator parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StochConfig {
    #[serde(default = "default_rsi_period")]
    pub rsi_period: usize,
    #[serde(default = "default_stoch_period")]
    pub stoch_period: usize,
    #[serde(default = "default_smooth")]
    pub k_smooth: usize,
    #[serde(default = "default_smooth")]
    pub d_smooth: usize,
    /// Buy gate: %K must be below this.
    #[serde(default = "default_oversold_upper")]
    pub oversold_upper: f64,
    /// Sell gate: %K must be above this.
    #[serde(default = "default_overbought_lower")]
    pub overbought_lower: f64,
}

impl Default for StochConfig {
    fn default() -> Self {
        Self {
            rsi_period: default_rsi_period(),
            stoch_period: default_stoch_period(),
            k_smooth: default_smooth(),
            d_smooth: default_smooth(),
            oversold_upper: default_oversold_upper(),
            overbought_lower: default_overbought_lower(),
        }
    }
}

/// EMA trend-confirmation periods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmaConfig {
    #[serde(default = "default_ema_fast")]
    pub fast: usize,
    #[serde(default = "default_ema_slow")]
    pub slow: usize,
}

impl Default for EmaConfig {
    fn default() -> Self {
        Self {
            fast: default_ema_fast(),
            slow: default_ema_slow(),
        }
    }
}

/// Volume-confirmation filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Minimum volume / volume-SMA ratio to confirm an entry.
    #[serde(default = "default_volume_ratio")]
    pub ratio: f64,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ratio: default_volume_ratio(),
        }
    }
}

/// Volatility-adjusted oversold/overbought band widening.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicBandsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bands_sensitivity")]
    pub sensitivity: f64,
    /// Look-back used for the baseline ATR mean.
    #[serde(default = "default_base_volatility_window")]
    pub base_volatility_window: usize,
}

impl Default for DynamicBandsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sensitivity: default_bands_sensitivity(),
            base_volatility_window: default_base_volatility_window(),
        }
    }
}

/// All strategy-evaluator tunables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyConfig {
    #[serde(default)]
    pub stoch: StochConfig,
    #[serde(default)]
    pub ema: EmaConfig,
    #[serde(default)]
    pub volume: VolumeConfig,
    #[serde(default)]
    pub dynamic_bands: DynamicBandsConfig,
}

/// Event hub fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventHubConfig {
    /// Per-subscriber bounded outbox; slow subscribers exceeding it drop.
    #[serde(default = "default_outbox_size")]
    pub outbox_size: usize,
    /// Ring size for the recent-trade replay buffer.
    #[serde(default = "default_recent_trades")]
    pub recent_trades: usize,
}

impl Default for EventHubConfig {
    fn default() -> Self {
        Self {
            outbox_size: default_outbox_size(),
            recent_trades: default_recent_trades(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Pulse engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Address the REST/WS API binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_crypto_mode")]
    pub crypto: ModeConfig,

    #[serde(default = "default_equities_mode")]
    pub equities: ModeConfig,

    #[serde(default)]
    pub signal_threshold: SignalThresholds,

    #[serde(default)]
    pub order: OrderConfig,

    #[serde(default)]
    pub position: PositionConfig,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub candles: CandleConfig,

    #[serde(default)]
    pub strategy: StrategyConfig,

    #[serde(default)]
    pub event_hub: EventHubConfig,

    /// Outbound broker request budget for the leaky-bucket limiter.
    #[serde(default = "default_rate_limit_per_min")]
    pub broker_rate_limit_per_min: u32,

    /// Queue equities submissions while the market is closed instead of
    /// skipping them.
    #[serde(default)]
    pub queue_when_closed: bool,

    /// Bound on in-flight work after a shutdown signal.
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,

    /// Append-only JSONL trade log path. Empty disables the journal.
    #[serde(default)]
    pub journal_path: String,
}

fn default_crypto_mode() -> ModeConfig {
    ModeConfig {
        tick_interval_ms: default_crypto_tick_ms(),
        symbols: default_crypto_symbols(),
        enabled: false,
    }
}

fn default_equities_mode() -> ModeConfig {
    ModeConfig {
        tick_interval_ms: default_equities_tick_ms(),
        symbols: default_equities_symbols(),
        enabled: false,
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            crypto: default_crypto_mode(),
            equities: default_equities_mode(),
            signal_threshold: SignalThresholds::default(),
            order: OrderConfig::default(),
            position: PositionConfig::default(),
            risk: RiskConfig::default(),
            candles: CandleConfig::default(),
            strategy: StrategyConfig::default(),
            event_hub: EventHubConfig::default(),
            broker_rate_limit_per_min: default_rate_limit_per_min(),
            queue_when_closed: false,
            shutdown_grace_seconds: default_shutdown_grace_seconds(),
            journal_path: String::new(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// A missing file is not an error to the process: callers fall back to
    /// defaults with a warning. A present-but-invalid file is a
    /// configuration error and should abort startup.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            crypto_symbols = ?config.crypto.symbols,
            equities_symbols = ?config.equities.symbols,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration using an atomic write (write to
    /// `.tmp`, then rename) so a crash mid-write never corrupts the file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved");
        Ok(())
    }

    /// Apply `TRADING_<SECTION>_<KEY>` environment overrides on top of the
    /// loaded file. Unparseable values are a hard error so a typo'd override
    /// aborts startup instead of silently trading with defaults.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        override_num(&mut self.crypto.tick_interval_ms, "TRADING_CRYPTO_TICK_INTERVAL_MS")?;
        override_num(&mut self.equities.tick_interval_ms, "TRADING_EQUITIES_TICK_INTERVAL_MS")?;
        override_symbols(&mut self.crypto.symbols, "TRADING_CRYPTO_SYMBOLS");
        override_symbols(&mut self.equities.symbols, "TRADING_EQUITIES_SYMBOLS");

        override_num(&mut self.signal_threshold.crypto, "TRADING_SIGNAL_THRESHOLD_CRYPTO")?;
        override_num(&mut self.signal_threshold.stocks, "TRADING_SIGNAL_THRESHOLD_STOCKS")?;

        override_num(&mut self.order.cooldown_seconds, "TRADING_ORDER_COOLDOWN_SECONDS")?;
        override_num(&mut self.order.timeout_seconds, "TRADING_ORDER_TIMEOUT_SECONDS")?;
        override_num(&mut self.order.max_retries_transient, "TRADING_ORDER_MAX_RETRIES_TRANSIENT")?;

        override_num(&mut self.position.max_concurrent, "TRADING_POSITION_MAX_CONCURRENT")?;
        override_num(&mut self.position.size_pct_equity, "TRADING_POSITION_SIZE_PCT_EQUITY")?;

        if let Ok(raw) = std::env::var("TRADING_RISK_DAILY_LOSS_LIMIT") {
            let parsed = raw
                .parse::<Decimal>()
                .with_context(|| format!("TRADING_RISK_DAILY_LOSS_LIMIT: invalid decimal '{raw}'"))?;
            self.risk.daily_loss_limit = Some(parsed);
        }

        override_num(&mut self.candles.buffer_size, "TRADING_CANDLES_BUFFER_SIZE")?;

        override_num(&mut self.strategy.stoch.rsi_period, "TRADING_STRATEGY_STOCH_RSI_PERIOD")?;
        override_num(&mut self.strategy.stoch.k_smooth, "TRADING_STRATEGY_STOCH_K_SMOOTH")?;
        override_num(&mut self.strategy.stoch.d_smooth, "TRADING_STRATEGY_STOCH_D_SMOOTH")?;
        override_num(&mut self.strategy.stoch.oversold_upper, "TRADING_STRATEGY_STOCH_OVERSOLD_UPPER")?;
        override_num(&mut self.strategy.stoch.overbought_lower, "TRADING_STRATEGY_STOCH_OVERBOUGHT_LOWER")?;
        override_num(&mut self.strategy.ema.fast, "TRADING_STRATEGY_EMA_FAST")?;
        override_num(&mut self.strategy.ema.slow, "TRADING_STRATEGY_EMA_SLOW")?;
        override_bool(&mut self.strategy.volume.enabled, "TRADING_STRATEGY_VOLUME_ENABLED")?;
        override_num(&mut self.strategy.volume.ratio, "TRADING_STRATEGY_VOLUME_RATIO")?;
        override_bool(&mut self.strategy.dynamic_bands.enabled, "TRADING_STRATEGY_DYNAMIC_BANDS_ENABLED")?;
        override_num(&mut self.strategy.dynamic_bands.sensitivity, "TRADING_STRATEGY_DYNAMIC_BANDS_SENSITIVITY")?;

        override_num(&mut self.event_hub.outbox_size, "TRADING_EVENT_HUB_OUTBOX_SIZE")?;
        override_num(&mut self.event_hub.recent_trades, "TRADING_EVENT_HUB_RECENT_TRADES")?;

        self.validate()
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.candles.buffer_size == 0 {
            anyhow::bail!("candles.buffer_size must be > 0");
        }
        if self.event_hub.outbox_size == 0 {
            anyhow::bail!("event_hub.outbox_size must be > 0");
        }
        if !(0.0..=1.0).contains(&self.signal_threshold.crypto)
            || !(0.0..=1.0).contains(&self.signal_threshold.stocks)
        {
            anyhow::bail!("signal_threshold values must be within [0, 1]");
        }
        if self.position.size_pct_equity <= 0.0 {
            anyhow::bail!("position.size_pct_equity must be > 0");
        }
        if self.strategy.ema.fast >= self.strategy.ema.slow {
            anyhow::bail!(
                "strategy.ema.fast ({}) must be shorter than strategy.ema.slow ({})",
                self.strategy.ema.fast,
                self.strategy.ema.slow
            );
        }
        Ok(())
    }
}

fn override_num<T: std::str::FromStr>(field: &mut T, key: &str) -> Result<()>
where
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = std::env::var(key) {
        match raw.parse::<T>() {
            Ok(v) => *field = v,
            Err(e) => anyhow::bail!("{key}: invalid value '{raw}': {e}"),
        }
    }
    Ok(())
}

fn override_bool(field: &mut bool, key: &str) -> Result<()> {
    if let Ok(raw) = std::env::var(key) {
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => *field = true,
            "0" | "false" | "no" | "off" => *field = false,
            other => anyhow::bail!("{key}: invalid boolean '{other}'"),
        }
    }
    Ok(())
}

fn override_symbols(field: &mut Vec<String>, key: &str) {
    if let Ok(raw) = std::env::var(key) {
        let symbols: Vec<String> = raw
            .split(',')
            .map(|s| crate::alpaca::symbols::canonical(s.trim()))
            .filter(|s| !s.is_empty())
            .collect();
        if symbols.is_empty() {
            warn!(key, "symbol override produced an empty list — keeping existing");
        } else {
            *field = symbols;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.crypto.tick_interval_ms, 1500);
        assert_eq!(cfg.equities.tick_interval_ms, 10_000);
        assert!(!cfg.crypto.enabled);
        assert!(!cfg.equities.enabled);
        assert!((cfg.signal_threshold.crypto - 0.70).abs() < f64::EPSILON);
        assert!((cfg.signal_threshold.stocks - 0.75).abs() < f64::EPSILON);
        assert_eq!(cfg.order.cooldown_seconds, 30);
        assert_eq!(cfg.order.timeout_seconds, 60);
        assert_eq!(cfg.order.max_retries_transient, 3);
        assert_eq!(cfg.position.max_concurrent, 5);
        assert_eq!(cfg.candles.buffer_size, 500);
        assert_eq!(cfg.strategy.stoch.oversold_upper, 35.0);
        assert_eq!(cfg.strategy.stoch.overbought_lower, 65.0);
        assert_eq!(cfg.strategy.ema.fast, 3);
        assert_eq!(cfg.strategy.ema.slow, 8);
        assert!(cfg.strategy.volume.enabled);
        assert!(!cfg.strategy.dynamic_bands.enabled);
        assert_eq!(cfg.event_hub.outbox_size, 256);
        assert_eq!(cfg.event_hub.recent_trades, 500);
        assert!(cfg.risk.daily_loss_limit.is_none());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.order.cooldown_seconds, 30);
        assert_eq!(cfg.crypto.symbols, vec!["BTCUSD", "ETHUSD", "SOLUSD"]);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "order": { "cooldown_seconds": 45 } }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.order.cooldown_seconds, 45);
        assert_eq!(cfg.order.timeout_seconds, 60);
        assert_eq!(cfg.position.max_concurrent, 5);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.crypto.symbols, cfg2.crypto.symbols);
        assert_eq!(cfg.order.cooldown_seconds, cfg2.order.cooldown_seconds);
        assert_eq!(cfg.event_hub.outbox_size, cfg2.event_hub.outbox_size);
    }

    #[test]
    fn validate_rejects_inverted_emas() {
        let mut cfg = RuntimeConfig::default();
        cfg.strategy.ema.fast = 21;
        cfg.strategy.ema.slow = 9;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_threshold() {
        let mut cfg = RuntimeConfig::default();
        cfg.signal_threshold.crypto = 1.5;
        assert!(cfg.validate().is_err());
    }
}

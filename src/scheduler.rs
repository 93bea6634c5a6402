// =============================================================================
// Scalping Scheduler — one cooperative loop per market mode
// =============================================================================
//
// Each tick:
//   1. loop-enabled and daily-loss gates
//   2. market-hours gate (equities only; crypto never closes)
//   3. walk the watchlist round-robin (the starting symbol rotates every
//      tick so no symbol is starved behind a busy one)
//   4. snapshot candles -> evaluate strategy -> act when strength clears
//      the per-mode threshold
//
// Per symbol, evaluation and submission run serially inside the tick; the
// order manager's dedup keeps the at-most-one-pending invariant regardless
// of overlap across modes. The loop exits promptly on cancellation.
// =============================================================================

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::market_data::CandleKey;
use crate::orders::{SubmitOutcome, SubmitParams};
use crate::strategy::Strategy;
use crate::types::{MarketMode, OrderType, SignalAction, TradeState};

pub struct ScalpingLoop {
    state: Arc<AppState>,
    strategy: Arc<dyn Strategy>,
    mode: MarketMode,
}

impl ScalpingLoop {
    pub fn new(state: Arc<AppState>, strategy: Arc<dyn Strategy>, mode: MarketMode) -> Self {
        Self {
            state,
            strategy,
            mode,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(mode = %self.mode, "scalping loop starting");
        let mut rr_offset: usize = 0;

        loop {
            let tick_ms = {
                let config = self.state.config.read();
                match self.mode {
                    MarketMode::Crypto => config.crypto.tick_interval_ms,
                    MarketMode::Equities => config.equities.tick_interval_ms,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(mode = %self.mode, "scalping loop stopping");
                    return;
                }
                _ = tokio::time::sleep(std::time::Duration::from_millis(tick_ms)) => {}
            }

            if !self.state.mode_enabled(self.mode) {
                continue;
            }

            // --- Daily loss halt -------------------------------------------
            let loss_limit = self.state.config.read().risk.daily_loss_limit;
            if let Some(limit) = loss_limit {
                let loss = self.state.metrics.session_loss();
                if loss >= limit {
                    warn!(mode = %self.mode, loss = %loss, limit = %limit, "daily loss limit hit — halting loop");
                    self.state.hub.broadcast(
                        "status",
                        None,
                        serde_json::json!({
                            "severity": "warning",
                            "message": format!("daily loss limit reached ({loss}); {} loop halted", self.mode),
                        }),
                    );
                    self.state.set_mode_enabled(self.mode, false);
                    continue;
                }
            }

            // --- Market-hours gate -----------------------------------------
            if self.mode == MarketMode::Equities
                && !self.state.gateway.is_market_open(MarketMode::Equities).await
            {
                debug!("equities market closed — tick skipped");
                self.state.hub.broadcast(
                    "status",
                    None,
                    serde_json::json!({
                        "severity": "info",
                        "message": "equities market closed; tick skipped",
                    }),
                );
                continue;
            }

            // --- Round-robin symbol walk -----------------------------------
            let symbols = {
                let config = self.state.config.read();
                match self.mode {
                    MarketMode::Crypto => config.crypto.symbols.clone(),
                    MarketMode::Equities => config.equities.symbols.clone(),
                }
            };
            if symbols.is_empty() {
                continue;
            }

            for i in 0..symbols.len() {
                if cancel.is_cancelled() {
                    return;
                }
                let symbol = &symbols[(rr_offset + i) % symbols.len()];
                self.process_symbol(symbol).await;
            }
            rr_offset = (rr_offset + 1) % symbols.len();
        }
    }

    async fn process_symbol(&self, symbol: &str) {
        if self.state.order_manager.is_quarantined(symbol) {
            return;
        }

        let (timeframe, strategy_cfg, threshold, max_concurrent) = {
            let config = self.state.config.read();
            (
                config.candles.timeframe.clone(),
                config.strategy.clone(),
                config.signal_threshold.for_mode(self.mode),
                config.position.max_concurrent as usize,
            )
        };

        let key = CandleKey::new(symbol, timeframe);
        let candles = self.state.candle_buffer.snapshot(&key);
        if candles.is_empty() {
            return;
        }

        let signal = self.strategy.evaluate(symbol, &candles, &strategy_cfg);
        let action = signal.action;
        let strength = signal.strength;
        self.state.record_signal(signal);

        if action == SignalAction::Hold {
            return;
        }
        if strength < threshold {
            debug!(
                symbol,
                action = %action,
                strength,
                threshold,
                "signal below threshold — not acting"
            );
            return;
        }

        let position = self.state.positions.state(symbol);
        match action {
            SignalAction::Buy => {
                // New entries and scale-ins only; pending orders wait.
                if !matches!(position.trade_state, TradeState::Idle | TradeState::Held) {
                    return;
                }
                if position.trade_state == TradeState::Idle
                    && self.state.positions.held_count() >= max_concurrent
                {
                    debug!(symbol, "max concurrent positions reached — entry skipped");
                    return;
                }

                let reference_price = self.state.candle_buffer.latest_close(&key);
                let outcome = self
                    .state
                    .order_manager
                    .submit(SubmitParams {
                        symbol: symbol.to_string(),
                        market_mode: self.mode,
                        side: crate::types::OrderSide::Buy,
                        qty: None,
                        order_type: OrderType::Market,
                        tif: None,
                        limit_price: None,
                        reference_price,
                    })
                    .await;
                self.report_outcome(symbol, "buy", outcome);
            }
            SignalAction::Sell => {
                if position.trade_state != TradeState::Held {
                    return;
                }
                let Some(qty) = self.state.positions.held_qty(symbol) else {
                    return;
                };

                let outcome = self
                    .state
                    .order_manager
                    .submit(SubmitParams {
                        symbol: symbol.to_string(),
                        market_mode: self.mode,
                        side: crate::types::OrderSide::Sell,
                        qty: Some(qty),
                        order_type: OrderType::Market,
                        tif: None,
                        limit_price: None,
                        reference_price: self.state.candle_buffer.latest_close(&key),
                    })
                    .await;
                self.report_outcome(symbol, "sell", outcome);
            }
            SignalAction::Hold => unreachable!(),
        }
    }

    fn report_outcome(&self, symbol: &str, side: &str, outcome: SubmitOutcome) {
        match outcome {
            SubmitOutcome::Submitted(order) => {
                info!(symbol, side, id = %order.id, qty = %order.qty, "scheduler submitted order");
            }
            SubmitOutcome::DedupRejected { .. } => {
                info!(symbol, side, "submission deduplicated (cooldown)");
            }
            SubmitOutcome::MarketClosed => {
                debug!(symbol, side, "market closed at submission time");
                self.state.hub.broadcast(
                    "status",
                    Some(symbol),
                    serde_json::json!({
                        "severity": "info",
                        "message": format!("{symbol} {side} skipped: market closed"),
                    }),
                );
            }
            SubmitOutcome::Rejected { reason } => {
                warn!(symbol, side, reason = %reason, "submission rejected");
            }
        }
    }
}

// =============================================================================
// Position Tracker — per-symbol trade state and realized P&L
// =============================================================================
//
// State machine per symbol:
//   Idle -> EntryPending -> Held -> ExitPending -> Idle
//
// A symbol never jumps Idle -> Held: the entry order must be observed
// filling. Scale-ins while Held re-average the entry price. All money
// arithmetic is decimal; realized P&L on a closing sell is
// (fill_price - entry_price) * fill_qty against the weighted-average entry.
//
// This tracker is the only writer of trade_state / entry fields. Fills that
// contradict the state machine are surfaced as errors so the order manager
// can quarantine the symbol.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::{OrderSide, TradeRecord, TradeState};

/// Residual quantity below which a position counts as fully closed.
const EPSILON_QTY: Decimal = Decimal::from_parts(1, 0, 0, false, 9); // 1e-9

/// Mutable per-symbol state. Entry fields are defined exactly while `Held`
/// or `ExitPending`.
#[derive(Debug, Clone, Serialize)]
pub struct PerSymbolState {
    pub symbol: String,
    pub trade_state: TradeState,
    pub entry_price: Option<Decimal>,
    pub entry_qty: Decimal,
    pub last_action_ts: DateTime<Utc>,
}

impl PerSymbolState {
    fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            trade_state: TradeState::Idle,
            entry_price: None,
            entry_qty: Decimal::ZERO,
            last_action_ts: Utc::now(),
        }
    }
}

/// A fill that contradicts the per-symbol state machine.
#[derive(Debug, Clone)]
pub struct InvariantViolation {
    pub symbol: String,
    pub detail: String,
}

impl std::fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.symbol, self.detail)
    }
}

pub struct PositionTracker {
    states: RwLock<HashMap<String, PerSymbolState>>,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Current state for a symbol (Idle default for unseen symbols).
    pub fn state(&self, symbol: &str) -> PerSymbolState {
        self.states
            .read()
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| PerSymbolState::new(symbol))
    }

    /// All tracked symbols.
    pub fn snapshot(&self) -> Vec<PerSymbolState> {
        self.states.read().values().cloned().collect()
    }

    /// Number of symbols currently holding a position (or exiting one).
    pub fn held_count(&self) -> usize {
        self.states
            .read()
            .values()
            .filter(|s| matches!(s.trade_state, TradeState::Held | TradeState::ExitPending))
            .count()
    }

    /// Open quantity for a held symbol.
    pub fn held_qty(&self, symbol: &str) -> Option<Decimal> {
        let states = self.states.read();
        let state = states.get(symbol)?;
        match state.trade_state {
            TradeState::Held | TradeState::ExitPending if state.entry_qty > Decimal::ZERO => {
                Some(state.entry_qty)
            }
            _ => None,
        }
    }

    /// Mark an entry order in flight. Idle -> EntryPending; scale-ins while
    /// Held keep the Held state.
    pub fn mark_entry_pending(&self, symbol: &str) {
        let mut states = self.states.write();
        let state = states
            .entry(symbol.to_string())
            .or_insert_with(|| PerSymbolState::new(symbol));
        if state.trade_state == TradeState::Idle {
            state.trade_state = TradeState::EntryPending;
        }
        state.last_action_ts = Utc::now();
    }

    /// Mark an exit order in flight. Held -> ExitPending.
    pub fn mark_exit_pending(&self, symbol: &str) {
        let mut states = self.states.write();
        let state = states
            .entry(symbol.to_string())
            .or_insert_with(|| PerSymbolState::new(symbol));
        if state.trade_state == TradeState::Held {
            state.trade_state = TradeState::ExitPending;
        }
        state.last_action_ts = Utc::now();
    }

    /// Roll a pending marker back after a failed or cancelled order.
    pub fn revert_pending(&self, symbol: &str) {
        let mut states = self.states.write();
        if let Some(state) = states.get_mut(symbol) {
            match state.trade_state {
                TradeState::EntryPending => state.trade_state = TradeState::Idle,
                TradeState::ExitPending => state.trade_state = TradeState::Held,
                _ => {}
            }
            state.last_action_ts = Utc::now();
        }
    }

    /// Apply one fill and emit its audit record.
    ///
    /// `qty` is the incremental fill quantity (callers convert the broker's
    /// cumulative counters into deltas).
    pub fn apply_fill(
        &self,
        symbol: &str,
        side: OrderSide,
        price: Decimal,
        qty: Decimal,
    ) -> Result<TradeRecord, InvariantViolation> {
        if qty <= Decimal::ZERO || price <= Decimal::ZERO {
            return Err(InvariantViolation {
                symbol: symbol.to_string(),
                detail: format!("non-positive fill (price {price}, qty {qty})"),
            });
        }

        let mut states = self.states.write();
        let state = states
            .entry(symbol.to_string())
            .or_insert_with(|| PerSymbolState::new(symbol));

        let now = Utc::now();
        state.last_action_ts = now;

        match (side, state.trade_state) {
            // --- Opening or scaling in -------------------------------------
            (OrderSide::Buy, TradeState::Idle | TradeState::EntryPending) => {
                state.entry_price = Some(price);
                state.entry_qty = qty;
                state.trade_state = TradeState::Held;
                info!(symbol, price = %price, qty = %qty, "position opened");
                Ok(open_record(symbol, side, price, qty, now))
            }
            (OrderSide::Buy, TradeState::Held) => {
                let prev_price = state.entry_price.unwrap_or(price);
                let prev_qty = state.entry_qty;
                let total_qty = prev_qty + qty;
                let avg = (prev_price * prev_qty + price * qty) / total_qty;
                state.entry_price = Some(avg);
                state.entry_qty = total_qty;
                info!(symbol, avg_entry = %avg, qty = %total_qty, "scaled into position");
                Ok(open_record(symbol, side, price, qty, now))
            }

            // --- Closing ----------------------------------------------------
            (OrderSide::Sell, TradeState::Held | TradeState::ExitPending) => {
                let entry_price = state.entry_price.ok_or_else(|| InvariantViolation {
                    symbol: symbol.to_string(),
                    detail: "held position without entry price".to_string(),
                })?;

                let realized = (price - entry_price) * qty;
                let realized_pct = if entry_price > Decimal::ZERO {
                    price / entry_price - Decimal::ONE
                } else {
                    Decimal::ZERO
                };

                state.entry_qty -= qty;
                if state.entry_qty <= EPSILON_QTY {
                    state.entry_qty = Decimal::ZERO;
                    state.entry_price = None;
                    state.trade_state = TradeState::Idle;
                } else {
                    state.trade_state = TradeState::Held;
                }

                info!(
                    symbol,
                    price = %price,
                    qty = %qty,
                    realized_pnl = %realized,
                    remaining = %state.entry_qty,
                    "position reduced"
                );

                Ok(TradeRecord {
                    id: Uuid::new_v4().to_string(),
                    symbol: symbol.to_string(),
                    side,
                    qty,
                    price,
                    value: price * qty,
                    ts: now,
                    realized_pnl: Some(realized),
                    realized_pnl_pct: Some(realized_pct),
                    status: "closed".to_string(),
                })
            }

            // --- Contradictions --------------------------------------------
            (side, trade_state) => {
                warn!(symbol, side = %side, state = %trade_state, "fill contradicts trade state");
                Err(InvariantViolation {
                    symbol: symbol.to_string(),
                    detail: format!("{side} fill while {trade_state}"),
                })
            }
        }
    }
}

impl Default for PositionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PositionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionTracker")
            .field("symbols", &self.states.read().len())
            .finish()
    }
}

fn open_record(
    symbol: &str,
    side: OrderSide,
    price: Decimal,
    qty: Decimal,
    ts: DateTime<Utc>,
) -> TradeRecord {
    TradeRecord {
        id: Uuid::new_v4().to_string(),
        symbol: symbol.to_string(),
        side,
        qty,
        price,
        value: price * qty,
        ts,
        realized_pnl: None,
        realized_pnl_pct: None,
        status: "open".to_string(),
    }
}

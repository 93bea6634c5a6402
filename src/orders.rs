// =============================================================================
// Order Manager — submission pipeline, dedup, and order state machine
// =============================================================================
//
// One logical writer for all order state. Responsibilities:
//   * assign client order ids (unique for the process lifetime)
//   * enforce the per-(symbol, side) cooldown and at-most-one-pending dedup
//   * size orders from account equity (integer shares for equities,
//     fractional clamped to broker minimums for crypto)
//   * submit through the gateway and track New -> PendingNew -> Accepted ->
//     ... -> terminal transitions from broker order updates
//   * cancel unfilled orders past the timeout, GC terminal orders after 24h
//
// Submission is never retried on timeout. A transient submit error schedules
// a reconciliation probe by client order id instead. Fills that contradict
// the position state machine quarantine the symbol for the session.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alpaca::error::GatewayError;
use crate::alpaca::{AssetInfo, BrokerGateway, OrderRequest, OrderUpdate};
use crate::config::{OrderConfig, PositionConfig};
use crate::hub::EventHub;
use crate::positions::PositionTracker;
use crate::types::{
    MarketMode, Order, OrderSide, OrderState, OrderType, TimeInForce, TradeRecord,
};

/// Terminal orders older than this are garbage-collected.
const TERMINAL_GC_HOURS: i64 = 24;
/// Delay before the first reconciliation probe after a transient submit error.
const RECONCILE_DELAY_SECS: u64 = 2;
/// How many reconciliation probes to attempt before giving up.
const RECONCILE_ATTEMPTS: u32 = 3;

/// Everything needed to submit one order. `qty: None` means "size from
/// account equity at `reference_price`".
#[derive(Debug, Clone)]
pub struct SubmitParams {
    pub symbol: String,
    pub market_mode: MarketMode,
    pub side: OrderSide,
    pub qty: Option<Decimal>,
    pub order_type: OrderType,
    pub tif: Option<TimeInForce>,
    pub limit_price: Option<Decimal>,
    pub reference_price: Option<Decimal>,
}

/// Typed submission outcome. Dedup is an expected result, not an error.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// The order is in flight (or already terminal if the broker acked a
    /// fill synchronously).
    Submitted(Order),
    /// Rejected by the cooldown / at-most-one-pending invariant.
    DedupRejected { symbol: String, side: OrderSide },
    /// The equities market is closed and queuing is disabled.
    MarketClosed,
    /// Validation or broker rejection; the reason is client-safe.
    Rejected { reason: String },
}

pub struct OrderManager {
    gateway: Arc<dyn BrokerGateway>,
    positions: Arc<PositionTracker>,
    hub: Arc<EventHub>,
    trade_tx: mpsc::UnboundedSender<TradeRecord>,

    orders: RwLock<HashMap<String, Order>>,
    last_submission: RwLock<HashMap<(String, OrderSide), DateTime<Utc>>>,
    quarantined: RwLock<HashSet<String>>,
    asset_info: RwLock<HashMap<String, AssetInfo>>,
    counter: AtomicU64,

    order_cfg: OrderConfig,
    size_pct: Decimal,
    queue_when_closed: bool,
}

impl OrderManager {
    pub fn new(
        gateway: Arc<dyn BrokerGateway>,
        positions: Arc<PositionTracker>,
        hub: Arc<EventHub>,
        trade_tx: mpsc::UnboundedSender<TradeRecord>,
        order_cfg: OrderConfig,
        position_cfg: &PositionConfig,
        queue_when_closed: bool,
    ) -> Self {
        Self {
            gateway,
            positions,
            hub,
            trade_tx,
            orders: RwLock::new(HashMap::new()),
            last_submission: RwLock::new(HashMap::new()),
            quarantined: RwLock::new(HashSet::new()),
            asset_info: RwLock::new(HashMap::new()),
            counter: AtomicU64::new(0),
            order_cfg,
            size_pct: Decimal::from_f64(position_cfg.size_pct_equity)
                .unwrap_or_else(|| Decimal::new(5, 3)),
            queue_when_closed,
        }
    }

    // -------------------------------------------------------------------------
    // Startup
    // -------------------------------------------------------------------------

    /// Cache broker-advertised minimums for the crypto watchlist so sizing
    /// can clamp to them. Missing asset info is tolerated with a warning.
    pub async fn preload_asset_info(&self, symbols: &[String]) {
        for symbol in symbols {
            match self.gateway.get_asset(symbol, MarketMode::Crypto).await {
                Ok(Some(info)) => {
                    debug!(symbol, min_order_size = ?info.min_order_size, "asset info cached");
                    self.asset_info.write().insert(symbol.clone(), info);
                }
                Ok(None) => warn!(symbol, "asset not known to broker"),
                Err(e) => warn!(symbol, error = %e, "asset info fetch failed"),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn open_orders(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .orders
            .read()
            .values()
            .filter(|o| !o.state.is_terminal())
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.submitted_at);
        orders
    }

    pub fn all_orders(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self.orders.read().values().cloned().collect();
        orders.sort_by_key(|o| o.submitted_at);
        orders
    }

    pub fn get_order(&self, client_id: &str) -> Option<Order> {
        self.orders.read().get(client_id).cloned()
    }

    pub fn quarantined_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.quarantined.read().iter().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn is_quarantined(&self, symbol: &str) -> bool {
        self.quarantined.read().contains(symbol)
    }

    // -------------------------------------------------------------------------
    // Submission pipeline
    // -------------------------------------------------------------------------

    pub async fn submit(&self, params: SubmitParams) -> SubmitOutcome {
        let symbol = params.symbol.clone();
        let side = params.side;

        // --- Quarantine gate -----------------------------------------------
        if self.is_quarantined(&symbol) {
            return SubmitOutcome::Rejected {
                reason: format!("{symbol} is quarantined for this session"),
            };
        }

        // --- Dedup gate -----------------------------------------------------
        if self.dedup_hit(&symbol, side) {
            info!(symbol = %symbol, side = %side, "submission dedup-rejected");
            return SubmitOutcome::DedupRejected { symbol, side };
        }

        // --- Market-mode gate ----------------------------------------------
        if params.market_mode == MarketMode::Equities
            && !self.gateway.is_market_open(MarketMode::Equities).await
            && !self.queue_when_closed
        {
            return SubmitOutcome::MarketClosed;
        }

        // --- Sizing ---------------------------------------------------------
        let qty = match self.resolve_qty(&params).await {
            Ok(qty) => qty,
            Err(reason) => return SubmitOutcome::Rejected { reason },
        };

        // --- Create and track the order ------------------------------------
        let client_id = self.next_client_order_id();
        let tif = params
            .tif
            .unwrap_or_else(|| TimeInForce::default_for(params.market_mode));

        let mut order = Order {
            id: client_id.clone(),
            broker_id: None,
            symbol: symbol.clone(),
            side,
            qty,
            order_type: params.order_type,
            tif,
            market_mode: params.market_mode,
            limit_price: params.limit_price,
            state: OrderState::New,
            submitted_at: Utc::now(),
            filled_avg_price: None,
            filled_qty: Decimal::ZERO,
            reason: None,
        };

        self.record_submission(&symbol, side);
        match side {
            OrderSide::Buy => self.positions.mark_entry_pending(&symbol),
            OrderSide::Sell => self.positions.mark_exit_pending(&symbol),
        }

        order.state = OrderState::PendingNew;
        self.orders.write().insert(client_id.clone(), order.clone());
        self.broadcast_order(&order);

        // --- Wire submission ------------------------------------------------
        let request = OrderRequest {
            client_order_id: client_id.clone(),
            symbol: symbol.clone(),
            market_mode: params.market_mode,
            side,
            qty,
            order_type: params.order_type,
            tif,
            limit_price: params.limit_price,
        };

        match self.gateway.submit_order(&request).await {
            Ok(ack) => {
                self.apply_broker_state(
                    &client_id,
                    Some(ack.broker_id),
                    ack.state,
                    ack.filled_avg_price,
                    ack.filled_qty,
                    None,
                );
                let order = self.get_order(&client_id).unwrap_or(order);
                info!(id = %client_id, symbol = %symbol, side = %side, qty = %qty, "order submitted");
                SubmitOutcome::Submitted(order)
            }
            Err(GatewayError::Adjustable(reason)) => {
                self.retry_adjusted(&client_id, request, &reason).await
            }
            Err(GatewayError::Transient(reason)) => {
                // The broker may or may not have received the order. Leave it
                // PendingNew and reconcile by client id.
                warn!(id = %client_id, reason = %reason, "transient submit error — scheduling reconciliation");
                SubmitOutcome::Submitted(self.get_order(&client_id).unwrap_or(order))
            }
            Err(GatewayError::WaitRequired(reason)) => {
                warn!(id = %client_id, reason = %reason, "submission deferred by broker");
                self.finalize_failed(&client_id, OrderState::Rejected, &reason);
                SubmitOutcome::MarketClosed
            }
            Err(GatewayError::Fatal(reason)) => {
                warn!(id = %client_id, reason = %reason, "submission rejected");
                self.finalize_failed(&client_id, OrderState::Rejected, &reason);
                SubmitOutcome::Rejected { reason }
            }
        }
    }

    /// One adjusted retry after an Adjustable error: halve the quantity
    /// (floored for equities) and resubmit. A second failure is terminal.
    async fn retry_adjusted(
        &self,
        client_id: &str,
        mut request: OrderRequest,
        first_reason: &str,
    ) -> SubmitOutcome {
        let halved = request.qty / Decimal::TWO;
        let adjusted = match request.market_mode {
            MarketMode::Equities => halved.floor(),
            MarketMode::Crypto => halved,
        };

        if adjusted <= Decimal::ZERO {
            self.finalize_failed(client_id, OrderState::Rejected, first_reason);
            return SubmitOutcome::Rejected {
                reason: format!("order size not adjustable further: {first_reason}"),
            };
        }

        info!(
            id = %client_id,
            original_qty = %request.qty,
            adjusted_qty = %adjusted,
            "retrying submission with adjusted size"
        );
        request.qty = adjusted;
        if let Some(order) = self.orders.write().get_mut(client_id) {
            order.qty = adjusted;
        }

        match self.gateway.submit_order(&request).await {
            Ok(ack) => {
                self.apply_broker_state(
                    client_id,
                    Some(ack.broker_id),
                    ack.state,
                    ack.filled_avg_price,
                    ack.filled_qty,
                    None,
                );
                match self.get_order(client_id) {
                    Some(order) => SubmitOutcome::Submitted(order),
                    None => SubmitOutcome::Rejected {
                        reason: "order lost during adjustment".to_string(),
                    },
                }
            }
            Err(e) => {
                let reason = e.to_string();
                self.finalize_failed(client_id, OrderState::Rejected, &reason);
                SubmitOutcome::Rejected { reason }
            }
        }
    }

    /// Cancel an order on behalf of a client. Terminal orders are a no-op.
    pub async fn cancel(&self, client_id: &str) -> Result<(), String> {
        let (broker_id, symbol) = {
            let orders = self.orders.read();
            let order = orders
                .get(client_id)
                .ok_or_else(|| format!("unknown order {client_id}"))?;
            if order.state.is_terminal() {
                return Ok(());
            }
            (order.broker_id.clone(), order.symbol.clone())
        };

        if let Some(broker_id) = broker_id {
            self.gateway
                .cancel_order(&broker_id)
                .await
                .map_err(|e| e.to_string())?;
        }

        self.apply_broker_state(client_id, None, OrderState::Cancelled, None, Decimal::ZERO, None);
        self.positions.revert_pending(&symbol);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Order update handling
    // -------------------------------------------------------------------------

    /// Consume broker order updates serially until cancelled.
    pub async fn run_update_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<OrderUpdate>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("order update loop stopping");
                    return;
                }
                update = rx.recv() => {
                    let Some(update) = update else {
                        info!("order update channel closed");
                        return;
                    };
                    self.handle_update(update);
                }
            }
        }
    }

    /// Apply one broker order update to the registry and, on fills, to the
    /// position tracker.
    pub fn handle_update(&self, update: OrderUpdate) {
        let known = self.orders.read().contains_key(&update.client_order_id);
        if !known {
            debug!(
                client_order_id = %update.client_order_id,
                "order update for unknown order — ignoring"
            );
            return;
        }

        self.apply_broker_state(
            &update.client_order_id,
            Some(update.broker_id.clone()),
            update.state,
            update.filled_avg_price,
            update.filled_qty,
            None,
        );
    }

    /// The single transition point for broker-reported state. Idempotent:
    /// updates for already-terminal orders are ignored, and cumulative fill
    /// quantities are converted into deltas exactly once.
    fn apply_broker_state(
        &self,
        client_id: &str,
        broker_id: Option<String>,
        new_state: OrderState,
        fill_price: Option<Decimal>,
        cumulative_fill_qty: Decimal,
        reason: Option<String>,
    ) {
        let (order_after, fill_delta) = {
            let mut orders = self.orders.write();
            let Some(order) = orders.get_mut(client_id) else {
                return;
            };

            if order.state.is_terminal() {
                debug!(id = %client_id, state = %order.state, "update after terminal state ignored");
                return;
            }

            if order.broker_id.is_none() {
                order.broker_id = broker_id;
            }

            let fill_delta = (cumulative_fill_qty - order.filled_qty).max(Decimal::ZERO);
            if cumulative_fill_qty > order.filled_qty {
                order.filled_qty = cumulative_fill_qty;
            }
            if fill_price.is_some() {
                order.filled_avg_price = fill_price;
            }
            order.state = new_state;
            if reason.is_some() {
                order.reason = reason;
            }

            (order.clone(), fill_delta)
        };

        // --- Feed fills into the position tracker --------------------------
        if fill_delta > Decimal::ZERO {
            if let Some(price) = order_after.filled_avg_price {
                match self
                    .positions
                    .apply_fill(&order_after.symbol, order_after.side, price, fill_delta)
                {
                    Ok(record) => {
                        if self.trade_tx.send(record).is_err() {
                            warn!("trade consumer gone — record dropped");
                        }
                        self.broadcast_position(&order_after.symbol);
                    }
                    Err(violation) => {
                        error!(
                            symbol = %violation.symbol,
                            detail = %violation.detail,
                            "invariant violation — quarantining symbol"
                        );
                        self.quarantined.write().insert(violation.symbol.clone());
                        self.hub.broadcast(
                            "status",
                            Some(&violation.symbol),
                            serde_json::json!({
                                "severity": "error",
                                "message": format!("symbol quarantined: {violation}"),
                            }),
                        );
                    }
                }
            } else {
                warn!(id = %client_id, "fill without average price — skipping");
            }
        }

        // --- Failed entries/exits roll their pending marker back -----------
        if matches!(
            order_after.state,
            OrderState::Cancelled | OrderState::Rejected | OrderState::Expired
        ) {
            self.positions.revert_pending(&order_after.symbol);
        }

        self.broadcast_order(&order_after);
    }

    // -------------------------------------------------------------------------
    // Maintenance: timeout sweep, terminal GC, reconciliation
    // -------------------------------------------------------------------------

    /// Periodic sweep cancelling unfilled orders past the timeout and
    /// collecting terminal orders older than 24h. Also reconciles orders
    /// stuck in PendingNew (transient submit errors).
    pub async fn run_maintenance_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("order maintenance loop stopping");
                    return;
                }
                _ = interval.tick() => {
                    self.sweep_timeouts().await;
                    self.reconcile_pending().await;
                    self.gc_terminal();
                }
            }
        }
    }

    async fn sweep_timeouts(&self) {
        let timeout = ChronoDuration::seconds(self.order_cfg.timeout_seconds as i64);
        let now = Utc::now();

        let expired: Vec<(String, Option<String>, String)> = self
            .orders
            .read()
            .values()
            .filter(|o| !o.state.is_terminal() && now - o.submitted_at > timeout)
            .map(|o| (o.id.clone(), o.broker_id.clone(), o.symbol.clone()))
            .collect();

        for (client_id, broker_id, symbol) in expired {
            warn!(id = %client_id, symbol = %symbol, "order timed out — cancelling");
            if let Some(broker_id) = &broker_id {
                if let Err(e) = self.gateway.cancel_order(broker_id).await {
                    warn!(id = %client_id, error = %e, "timeout cancel failed — will retry next sweep");
                    continue;
                }
            }
            self.apply_broker_state(
                &client_id,
                None,
                OrderState::Cancelled,
                None,
                Decimal::ZERO,
                Some("order timeout".to_string()),
            );
        }
    }

    /// Probe the broker for orders stuck in PendingNew longer than the
    /// reconciliation delay (a transient submit error left their fate
    /// unknown).
    async fn reconcile_pending(&self) {
        let stale = Utc::now() - ChronoDuration::seconds(RECONCILE_DELAY_SECS as i64);
        let pending: Vec<String> = self
            .orders
            .read()
            .values()
            .filter(|o| o.state == OrderState::PendingNew && o.submitted_at < stale)
            .map(|o| o.id.clone())
            .collect();

        for client_id in pending {
            let mut found = None;
            for _ in 0..RECONCILE_ATTEMPTS {
                match self.gateway.get_order_by_client_id(&client_id).await {
                    Ok(result) => {
                        found = Some(result);
                        break;
                    }
                    Err(e) if e.is_transient() => continue,
                    Err(e) => {
                        warn!(id = %client_id, error = %e, "reconciliation failed");
                        found = Some(None);
                        break;
                    }
                }
            }

            match found {
                Some(Some(broker_order)) => {
                    info!(id = %client_id, state = ?broker_order.state, "order reconciled");
                    self.apply_broker_state(
                        &client_id,
                        Some(broker_order.broker_id),
                        broker_order.state,
                        broker_order.filled_avg_price,
                        broker_order.filled_qty,
                        None,
                    );
                }
                Some(None) => {
                    // The broker never saw it: the submission was lost.
                    warn!(id = %client_id, "submission lost — marking rejected");
                    self.apply_broker_state(
                        &client_id,
                        None,
                        OrderState::Rejected,
                        None,
                        Decimal::ZERO,
                        Some("submission lost".to_string()),
                    );
                }
                None => {
                    debug!(id = %client_id, "reconciliation deferred (broker unreachable)");
                }
            }
        }
    }

    fn gc_terminal(&self) {
        let cutoff = Utc::now() - ChronoDuration::hours(TERMINAL_GC_HOURS);
        let mut orders = self.orders.write();
        let before = orders.len();
        orders.retain(|_, o| !(o.state.is_terminal() && o.submitted_at < cutoff));
        let removed = before - orders.len();
        if removed > 0 {
            debug!(removed, "terminal orders collected");
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn next_client_order_id(&self) -> String {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("trade-{}-{}", Utc::now().timestamp_millis(), counter)
    }

    /// True when a submission for `(symbol, side)` must be dedup-rejected:
    /// either a non-terminal order exists, or a submission happened within
    /// the cooldown window.
    fn dedup_hit(&self, symbol: &str, side: OrderSide) -> bool {
        let has_pending = self
            .orders
            .read()
            .values()
            .any(|o| o.symbol == symbol && o.side == side && !o.state.is_terminal());
        if has_pending {
            return true;
        }

        let cooldown = ChronoDuration::seconds(self.order_cfg.cooldown_seconds as i64);
        self.last_submission
            .read()
            .get(&(symbol.to_string(), side))
            .is_some_and(|last| Utc::now() - *last < cooldown)
    }

    fn record_submission(&self, symbol: &str, side: OrderSide) {
        self.last_submission
            .write()
            .insert((symbol.to_string(), side), Utc::now());
    }

    /// Resolve the final order quantity: explicit, or sized from equity.
    async fn resolve_qty(&self, params: &SubmitParams) -> Result<Decimal, String> {
        let raw = match params.qty {
            Some(qty) => qty,
            None => {
                let price = params
                    .reference_price
                    .filter(|p| *p > Decimal::ZERO)
                    .ok_or_else(|| "no reference price for sizing".to_string())?;
                let account = self
                    .gateway
                    .get_account()
                    .await
                    .map_err(|e| format!("account unavailable for sizing: {e}"))?;
                account.equity * self.size_pct / price
            }
        };

        if raw <= Decimal::ZERO {
            return Err(format!("order size must be positive (got {raw})"));
        }

        match params.market_mode {
            MarketMode::Equities => {
                let shares = raw.floor();
                if shares < Decimal::ONE {
                    return Err(format!("sized below one share ({raw})"));
                }
                Ok(shares)
            }
            MarketMode::Crypto => {
                let mut qty = raw;
                if let Some(info) = self.asset_info.read().get(&params.symbol) {
                    if let Some(increment) = info.min_trade_increment {
                        if increment > Decimal::ZERO {
                            qty = (qty / increment).floor() * increment;
                        }
                    }
                    if let Some(min) = info.min_order_size {
                        if qty < min {
                            qty = min;
                        }
                    }
                }
                if qty <= Decimal::ZERO {
                    return Err(format!("sized below broker minimum ({raw})"));
                }
                Ok(qty)
            }
        }
    }

    /// Mark an order terminal after a failed submission and roll back its
    /// position marker.
    fn finalize_failed(&self, client_id: &str, state: OrderState, reason: &str) {
        let symbol = {
            let mut orders = self.orders.write();
            let Some(order) = orders.get_mut(client_id) else {
                return;
            };
            order.state = state;
            order.reason = Some(reason.to_string());
            order.symbol.clone()
        };
        self.positions.revert_pending(&symbol);
        if let Some(order) = self.get_order(client_id) {
            self.broadcast_order(&order);
        }
    }

    fn broadcast_order(&self, order: &Order) {
        if let Ok(data) = serde_json::to_value(order) {
            self.hub.broadcast("order_update", Some(&order.symbol), data);
        }
    }

    fn broadcast_position(&self, symbol: &str) {
        let state = self.positions.state(symbol);
        if let Ok(data) = serde_json::to_value(&state) {
            self.hub.broadcast("position_update", Some(symbol), data);
        }
    }
}

impl std::fmt::Debug for OrderManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderManager")
            .field("orders", &self.orders.read().len())
            .field("quarantined", &self.quarantined.read().len())
            .finish()
    }
}

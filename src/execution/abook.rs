// =============================================================================
// A-Book Execution Engine — externalized order lifecycle
// =============================================================================
//
// Owns every order sent upstream:
//
//   ROUTED ──(SOR pick + NewOrderSingle)──▶ SENT ──(ExecType=0)──▶ ACKNOWLEDGED
//   ACKNOWLEDGED/SENT ──(trade reports)──▶ PARTIALLY_FILLED* ──▶ FILLED
//   any working state ──(reject / cancel)──▶ REJECTED / CANCELED
//   SENT ──(send timeout)──▶ UNKNOWN ──(OrderStatusRequest)──▶ resolved
//
// Hard rules carried through this module:
//   - a fresh ClOrdID for every wire submission (failover resubmits and
//     cancel/replace included); ClOrdIDs are never reused,
//   - ExecutionReports are deduplicated by ExecID — applying the same report
//     twice is a no-op on order and position state,
//   - reports with an unknown ClOrdID raise an alert and are dropped; they
//     never create positions,
//   - NewOrderSingle is never silently retried after SENT — recovery goes
//     through the UNKNOWN path,
//   - fills update (filled volume, VWAP, state) atomically under the order
//     store lock; the ledger is applied per confirmed fill.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::errors::TradeError;
use crate::events::{EngineEvent, EventBus};
use crate::exec_quality::ExecutionQualityRecorder;
use crate::execution::bbook::{BBookEngine, ExitParams};
use crate::execution::OrderStore;
use crate::fix::message::{msg_type, sending_time, tags, FixMessage};
use crate::fix::session::FixSessionHandle;
use crate::position_ledger::PositionLedger;
use crate::risk_gate::RiskGate;
use crate::runtime_config::RuntimeConfig;
use crate::sor::{RouteCandidate, SmartOrderRouter};
use crate::types::{new_cl_ord_id, now_ms, Order, OrderStatus, OrderType};

const EPS: f64 = 1e-9;

/// Volatile per-order state that never leaves this engine.
struct OrderRuntime {
    /// ExecIDs already applied (idempotence under resend / PossDup).
    exec_ids: HashSet<String>,
    /// Remaining failover candidates, best first.
    candidates: VecDeque<RouteCandidate>,
    /// The quote the active submission was priced against.
    reference_price: f64,
    failover_used: bool,
    reserved_notional: f64,
    pending_cancel: Option<String>,
    pip_factor: f64,
    contract_size: f64,
}

/// The externalization engine.
pub struct ABookEngine {
    config: Arc<RwLock<RuntimeConfig>>,
    store: Arc<OrderStore>,
    sor: Arc<SmartOrderRouter>,
    risk: Arc<RiskGate>,
    ledger: Arc<PositionLedger>,
    quality: Arc<ExecutionQualityRecorder>,
    events: EventBus,
    bbook: Arc<BBookEngine>,
    sessions: RwLock<HashMap<String, FixSessionHandle>>,
    runtime: Mutex<HashMap<String, OrderRuntime>>,
}

impl ABookEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<RwLock<RuntimeConfig>>,
        store: Arc<OrderStore>,
        sor: Arc<SmartOrderRouter>,
        risk: Arc<RiskGate>,
        ledger: Arc<PositionLedger>,
        quality: Arc<ExecutionQualityRecorder>,
        events: EventBus,
        bbook: Arc<BBookEngine>,
    ) -> Self {
        Self {
            config,
            store,
            sor,
            risk,
            ledger,
            quality,
            events,
            bbook,
            sessions: RwLock::new(HashMap::new()),
            runtime: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_session(&self, handle: FixSessionHandle) {
        info!(lp = %handle.lp_id, "FIX session registered with A-book engine");
        self.sessions.write().insert(handle.lp_id.clone(), handle);
    }

    fn session(&self, lp: &str) -> Result<FixSessionHandle, TradeError> {
        self.sessions
            .read()
            .get(lp)
            .cloned()
            .ok_or_else(|| TradeError::SessionDown(format!("no session for {lp}")))
    }

    // -------------------------------------------------------------------------
    // Submission
    // -------------------------------------------------------------------------

    /// Route the order via the SOR and send the NewOrderSingle. Walks the
    /// candidate list on session-level send failures; LP-level rejects come
    /// back asynchronously and take the failover path instead.
    pub async fn submit(
        self: &Arc<Self>,
        order_id: &str,
        forced_lp: Option<&str>,
        reserved: f64,
    ) -> Result<(), TradeError> {
        let order = self
            .store
            .get(order_id)
            .ok_or_else(|| TradeError::OrderNotFound(order_id.to_string()))?;

        let mut candidates: VecDeque<RouteCandidate> = self
            .sor
            .select_candidates(&order.symbol, order.side, order.remaining_volume)?
            .into();
        if let Some(lp) = forced_lp {
            candidates.retain(|c| c.lp == lp);
            if candidates.is_empty() {
                return Err(TradeError::NoEligibleLp(format!(
                    "routing rule targets {lp} but it is not eligible"
                )));
            }
        }

        let sym = self.config.read().symbol(&order.symbol);
        self.runtime.lock().insert(
            order_id.to_string(),
            OrderRuntime {
                exec_ids: HashSet::new(),
                candidates,
                reference_price: 0.0,
                failover_used: false,
                reserved_notional: reserved,
                pending_cancel: None,
                pip_factor: sym.pip_factor,
                contract_size: sym.contract_size,
            },
        );

        loop {
            let next = {
                let mut runtime = self.runtime.lock();
                runtime.get_mut(order_id).and_then(|r| {
                    let c = r.candidates.pop_front();
                    if let Some(c) = &c {
                        r.reference_price = c.price;
                    }
                    c
                })
            };
            let Some(candidate) = next else {
                self.runtime.lock().remove(order_id);
                return Err(TradeError::NoEligibleLp(format!(
                    "all candidates failed for {}",
                    order.symbol
                )));
            };

            match self.send_new_order_single(order_id, &candidate).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        order_id = %order_id,
                        lp = %candidate.lp,
                        error = %e,
                        "send failed — trying next candidate"
                    );
                }
            }
        }
    }

    /// One wire submission: fresh ClOrdID, sequence persisted before the
    /// bytes leave (inside the session), then SENT is published and the
    /// timeout watchdog armed.
    async fn send_new_order_single(
        self: &Arc<Self>,
        order_id: &str,
        candidate: &RouteCandidate,
    ) -> Result<(), TradeError> {
        let order = self
            .store
            .get(order_id)
            .ok_or_else(|| TradeError::OrderNotFound(order_id.to_string()))?;
        let session = self.session(&candidate.lp)?;

        let cl_ord_id = new_cl_ord_id();
        self.store.map_cl_ord_id(&cl_ord_id, order_id);

        let mut fields: Vec<(u32, String)> = vec![
            (tags::CL_ORD_ID, cl_ord_id.clone()),
            (tags::SYMBOL, order.symbol.clone()),
            (tags::SIDE, order.side.fix_value().to_string()),
            (tags::ORDER_QTY, format_qty(order.remaining_volume)),
            (tags::ORD_TYPE, order.order_type.fix_value().to_string()),
        ];
        if matches!(order.order_type, OrderType::Limit | OrderType::StopLimit) {
            if let Some(price) = order.requested_price {
                fields.push((tags::PRICE, format_px(price)));
            }
        }
        if matches!(order.order_type, OrderType::Stop | OrderType::StopLimit) {
            if let Some(trigger) = order.trigger_price {
                fields.push((tags::STOP_PX, format_px(trigger)));
            }
        }
        fields.push((tags::TIME_IN_FORCE, order.time_in_force.fix_value().to_string()));
        fields.push((tags::TRANSACT_TIME, sending_time()));

        session
            .send(msg_type::NEW_ORDER_SINGLE, fields, true)
            .await?;

        let sent_at = now_ms();
        if let Some(updated) = self.store.update(order_id, |o| {
            if o.status.can_transition_to(OrderStatus::Sent) {
                o.status = OrderStatus::Sent;
            }
            o.target_lp = Some(candidate.lp.clone());
            o.cl_ord_id = Some(cl_ord_id.clone());
            o.sent_at_ms = Some(sent_at);
        }) {
            self.publish_order(&updated);
        }

        info!(
            order_id = %order_id,
            lp = %candidate.lp,
            cl_ord_id = %cl_ord_id,
            price = candidate.price,
            "NewOrderSingle sent"
        );

        self.spawn_timeout_watchdog(order_id.to_string(), cl_ord_id);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Timeout recovery (the UNKNOWN path)
    // -------------------------------------------------------------------------

    fn spawn_timeout_watchdog(self: &Arc<Self>, order_id: String, cl_ord_id: String) {
        let engine = self.clone();
        let (send_timeout, recovery_timeout) = {
            let config = engine.config.read();
            (
                Duration::from_millis(config.engine.send_timeout_ms),
                Duration::from_millis(config.engine.recovery_timeout_ms),
            )
        };

        tokio::spawn(async move {
            sleep(send_timeout).await;

            // Only this submission, and only when no report ever arrived.
            let stale = engine.store.get(&order_id).is_some_and(|o| {
                o.status == OrderStatus::Sent && o.cl_ord_id.as_deref() == Some(&cl_ord_id)
            });
            if !stale {
                return;
            }

            warn!(order_id = %order_id, cl_ord_id = %cl_ord_id, "send timeout — order state UNKNOWN");
            if let Some(updated) = engine.store.update(&order_id, |o| {
                if o.status.can_transition_to(OrderStatus::Unknown) {
                    o.status = OrderStatus::Unknown;
                }
            }) {
                engine.publish_order(&updated);
            }
            engine.events.publish(EngineEvent::alert(format!(
                "order {order_id} timed out waiting for an execution report — querying status"
            )));
            engine.send_status_request(&order_id).await;

            // Re-query once mid-way through the recovery window.
            let third = recovery_timeout / 3;
            sleep(third).await;
            if engine.order_status(&order_id) == Some(OrderStatus::Unknown) {
                engine.send_status_request(&order_id).await;
            }
            sleep(recovery_timeout - third).await;

            if engine.order_status(&order_id) == Some(OrderStatus::Unknown) {
                warn!(order_id = %order_id, "UNKNOWN unresolved — rejecting with Timeout");
                let lp = engine
                    .store
                    .get(&order_id)
                    .and_then(|o| o.target_lp)
                    .unwrap_or_default();
                engine.finish_rejected(&order_id, &lp, "Timeout: no execution report");
                engine.events.publish(EngineEvent::alert(format!(
                    "order {order_id} abandoned after recovery timeout"
                )));
            }
        });
    }

    fn order_status(&self, order_id: &str) -> Option<OrderStatus> {
        self.store.get(order_id).map(|o| o.status)
    }

    async fn send_status_request(&self, order_id: &str) {
        let Some(order) = self.store.get(order_id) else {
            return;
        };
        let (Some(lp), Some(cl)) = (order.target_lp.clone(), order.cl_ord_id.clone()) else {
            return;
        };
        let Ok(session) = self.session(&lp) else {
            return;
        };
        let fields = vec![
            (tags::CL_ORD_ID, cl),
            // OrderID is LP-assigned and may be unknown; "NONE" per FIX usage.
            (tags::ORDER_ID, "NONE".to_string()),
            (tags::SYMBOL, order.symbol.clone()),
            (tags::SIDE, order.side.fix_value().to_string()),
        ];
        if let Err(e) = session
            .send(msg_type::ORDER_STATUS_REQUEST, fields, false)
            .await
        {
            warn!(order_id = %order_id, error = %e, "status request could not be sent");
        }
    }

    // -------------------------------------------------------------------------
    // ExecutionReport application
    // -------------------------------------------------------------------------

    pub async fn handle_exec_report(self: &Arc<Self>, lp: &str, msg: &FixMessage) {
        let Some(cl_ord_id) = msg.get(tags::CL_ORD_ID) else {
            warn!(lp = %lp, "ExecutionReport without ClOrdID dropped");
            return;
        };
        let Some(order_id) = self.store.resolve_cl_ord_id(cl_ord_id) else {
            // Never create state from unsolicited reports.
            warn!(lp = %lp, cl_ord_id = %cl_ord_id, "unsolicited ExecutionReport");
            self.events.publish(EngineEvent::alert(format!(
                "unsolicited execution report from {lp} for ClOrdID {cl_ord_id}"
            )));
            return;
        };

        let Some(order) = self.store.get(&order_id) else {
            return;
        };
        if order.status.is_terminal() {
            // Post-resend replays of already-settled orders are no-ops.
            debug!(order_id = %order_id, "report for terminal order ignored");
            return;
        }

        // ExecID idempotence: the same report applied twice is a no-op.
        if let Some(exec_id) = msg.get(tags::EXEC_ID) {
            let mut runtime = self.runtime.lock();
            let Some(rt) = runtime.get_mut(&order_id) else {
                return;
            };
            if !rt.exec_ids.insert(exec_id.to_string()) {
                debug!(order_id = %order_id, exec_id = %exec_id, "duplicate ExecID ignored");
                return;
            }
        }

        let exec_type = msg
            .get(tags::EXEC_TYPE)
            .or_else(|| msg.get(tags::ORD_STATUS))
            .unwrap_or("");

        match exec_type {
            // NEW
            "0" => {
                if let Some(updated) = self.store.update(&order_id, |o| {
                    if o.status.can_transition_to(OrderStatus::Acknowledged) {
                        o.status = OrderStatus::Acknowledged;
                    }
                }) {
                    self.publish_order(&updated);
                }
            }
            // Trade: F (FIX 4.4) plus legacy 1/2 partial/full.
            "F" | "1" | "2" => self.apply_trade(&order_id, lp, msg),
            // Canceled.
            "4" => self.finish_canceled(&order_id),
            // Replaced: the LP accepted our cancel/replace.
            "5" => {
                if let Some(updated) = self.store.update(&order_id, |o| {
                    if let Some(qty) = msg.get_f64(tags::ORDER_QTY) {
                        o.requested_volume = qty;
                        o.remaining_volume = (qty - o.filled_volume).max(0.0);
                    }
                    if let Some(px) = msg.get_f64(tags::PRICE) {
                        o.requested_price = Some(px);
                    }
                }) {
                    self.publish_order(&updated);
                }
            }
            // Rejected.
            "8" => {
                let reason = msg.get(tags::TEXT).unwrap_or("rejected by LP").to_string();
                self.handle_lp_reject(&order_id, lp, &reason).await;
            }
            other => {
                debug!(order_id = %order_id, exec_type = other, "unhandled ExecType");
            }
        }
    }

    /// Apply one trade report: volumes and state atomically, then the ledger.
    fn apply_trade(self: &Arc<Self>, order_id: &str, lp: &str, msg: &FixMessage) {
        let last_qty = msg.get_f64(tags::LAST_QTY).unwrap_or(0.0);
        let last_px = msg
            .get_f64(tags::LAST_PX)
            .or_else(|| msg.get_f64(tags::AVG_PX))
            .unwrap_or(0.0);
        if last_qty <= 0.0 || last_px <= 0.0 {
            warn!(order_id = %order_id, "trade report without usable qty/px dropped");
            return;
        }

        let mut fill_qty = 0.0;
        let Some(updated) = self.store.update(order_id, |o| {
            fill_qty = last_qty.min(o.remaining_volume);
            let new_filled = o.filled_volume + fill_qty;
            if new_filled > EPS {
                o.avg_fill_price =
                    (o.avg_fill_price * o.filled_volume + last_px * fill_qty) / new_filled;
            }
            o.filled_volume = new_filled;
            o.remaining_volume = (o.requested_volume - new_filled).max(0.0);
            o.partial_fill_count += 1;
            let next = if o.remaining_volume <= EPS {
                OrderStatus::Filled
            } else {
                OrderStatus::PartiallyFilled
            };
            if o.status.can_transition_to(next) {
                o.status = next;
            }
        }) else {
            return;
        };
        if fill_qty <= 0.0 {
            return;
        }

        info!(
            order_id = %order_id,
            lp = %lp,
            qty = fill_qty,
            px = last_px,
            filled = updated.filled_volume,
            status = %updated.status,
            "fill applied"
        );

        self.apply_fill_to_ledger(&updated, fill_qty, last_px);
        self.publish_order(&updated);

        if updated.status == OrderStatus::Filled {
            self.finish_filled(&updated, lp);
        }
    }

    fn apply_fill_to_ledger(&self, order: &Order, volume: f64, price: f64) {
        let contract_size = self
            .runtime
            .lock()
            .get(&order.id)
            .map(|r| r.contract_size)
            .unwrap_or_else(|| self.config.read().symbol(&order.symbol).contract_size);

        match &order.closing_position_id {
            Some(position_id) => {
                match self
                    .ledger
                    .apply_close_fill(&order.account_id, position_id, volume, price)
                {
                    Ok(outcome) => {
                        self.risk.on_realized(&order.account_id, outcome.realized_pnl)
                    }
                    Err(e) => warn!(
                        order_id = %order.id,
                        position_id = %position_id,
                        error = %e,
                        "closing fill could not be applied"
                    ),
                }
            }
            None => {
                let position = self.ledger.apply_open_fill(
                    &order.account_id,
                    &order.symbol,
                    order.side,
                    volume,
                    price,
                    contract_size,
                    &order.id,
                );
                self.bbook.register_exits(ExitParams {
                    position_id: position.id,
                    account_id: order.account_id.clone(),
                    symbol: order.symbol.clone(),
                    side: order.side,
                    stop_loss: order.stop_loss,
                    take_profit: order.take_profit,
                });
            }
        }
    }

    // -------------------------------------------------------------------------
    // Terminal handling
    // -------------------------------------------------------------------------

    fn finish_filled(&self, order: &Order, lp: &str) {
        let Some(runtime) = self.runtime.lock().remove(&order.id) else {
            return;
        };
        self.risk.release(&order.account_id, runtime.reserved_notional);

        let latency_ms = order.sent_at_ms.map(|sent| (now_ms() - sent) as f64);
        let reference = order.requested_price.unwrap_or(runtime.reference_price);
        self.quality.record_fill(
            &order.id,
            lp,
            (reference > 0.0).then_some(reference),
            order.avg_fill_price,
            runtime.pip_factor,
            latency_ms,
            order.partial_fill_count,
        );
    }

    fn finish_canceled(&self, order_id: &str) {
        let Some(updated) = self.store.update(order_id, |o| {
            if o.status.can_transition_to(OrderStatus::Canceled) {
                o.status = OrderStatus::Canceled;
            }
        }) else {
            return;
        };
        if updated.status != OrderStatus::Canceled {
            return;
        }
        if let Some(runtime) = self.runtime.lock().remove(order_id) {
            self.risk
                .release(&updated.account_id, runtime.reserved_notional);
        }
        info!(order_id = %order_id, "order canceled by LP confirmation");
        self.publish_order(&updated);
    }

    fn finish_rejected(&self, order_id: &str, lp: &str, reason: &str) {
        let Some(updated) = self.store.update(order_id, |o| {
            if o.status.can_transition_to(OrderStatus::Rejected) {
                o.status = OrderStatus::Rejected;
                o.last_reject_reason = Some(reason.to_string());
            }
        }) else {
            return;
        };
        if updated.status != OrderStatus::Rejected {
            return;
        }
        if let Some(runtime) = self.runtime.lock().remove(order_id) {
            self.risk
                .release(&updated.account_id, runtime.reserved_notional);
        }
        if !lp.is_empty() {
            self.quality.record_reject(order_id, lp, reason);
        }
        warn!(order_id = %order_id, lp = %lp, reason = %reason, "order rejected");
        self.publish_order(&updated);
    }

    /// LP-level reject: one automatic failover to the next SOR candidate for
    /// transient causes, terminal REJECTED otherwise.
    async fn handle_lp_reject(self: &Arc<Self>, order_id: &str, lp: &str, reason: &str) {
        let auto_failover = self.config.read().engine.auto_failover;

        let next_candidate = {
            let mut runtime = self.runtime.lock();
            match runtime.get_mut(order_id) {
                Some(rt)
                    if auto_failover && !rt.failover_used && is_transient_reject(reason) =>
                {
                    rt.failover_used = true;
                    let next = rt.candidates.pop_front();
                    if let Some(c) = &next {
                        rt.reference_price = c.price;
                    }
                    next
                }
                _ => None,
            }
        };

        // The rejecting LP is debited either way.
        self.quality.record_reject(order_id, lp, reason);

        match next_candidate {
            Some(candidate) => {
                info!(
                    order_id = %order_id,
                    from = %lp,
                    to = %candidate.lp,
                    reason = %reason,
                    "transient reject — failing over to next candidate"
                );
                if let Err(e) = self.send_new_order_single(order_id, &candidate).await {
                    warn!(order_id = %order_id, error = %e, "failover submission failed");
                    self.finish_rejected_after_quality(order_id, reason);
                }
            }
            None => self.finish_rejected_after_quality(order_id, reason),
        }
    }

    /// Terminal reject when the quality sample was already recorded.
    fn finish_rejected_after_quality(&self, order_id: &str, reason: &str) {
        let Some(updated) = self.store.update(order_id, |o| {
            if o.status.can_transition_to(OrderStatus::Rejected) {
                o.status = OrderStatus::Rejected;
                o.last_reject_reason = Some(reason.to_string());
            }
        }) else {
            return;
        };
        if let Some(runtime) = self.runtime.lock().remove(order_id) {
            self.risk
                .release(&updated.account_id, runtime.reserved_notional);
        }
        self.publish_order(&updated);
    }

    // -------------------------------------------------------------------------
    // Cancel / replace
    // -------------------------------------------------------------------------

    pub async fn cancel(&self, order_id: &str) -> Result<(), TradeError> {
        let order = self
            .store
            .get(order_id)
            .ok_or_else(|| TradeError::OrderNotFound(order_id.to_string()))?;
        if order.status.is_terminal() {
            return Err(TradeError::OrderNotCancelable(format!(
                "{order_id} is {}",
                order.status
            )));
        }

        // Not yet on the wire: cancel locally.
        if matches!(order.status, OrderStatus::New | OrderStatus::Routed) {
            if let Some(updated) = self.store.update(order_id, |o| {
                o.status = OrderStatus::Canceled;
            }) {
                if let Some(runtime) = self.runtime.lock().remove(order_id) {
                    self.risk
                        .release(&updated.account_id, runtime.reserved_notional);
                }
                self.publish_order(&updated);
            }
            return Ok(());
        }

        let (lp, orig_cl) = match (&order.target_lp, &order.cl_ord_id) {
            (Some(lp), Some(cl)) => (lp.clone(), cl.clone()),
            _ => {
                return Err(TradeError::OrderNotCancelable(format!(
                    "{order_id} has no active submission"
                )))
            }
        };
        let session = self.session(&lp)?;

        let cancel_cl = new_cl_ord_id();
        self.store.map_cl_ord_id(&cancel_cl, order_id);
        let fields = vec![
            (tags::CL_ORD_ID, cancel_cl.clone()),
            (tags::ORIG_CL_ORD_ID, orig_cl),
            (tags::SYMBOL, order.symbol.clone()),
            (tags::SIDE, order.side.fix_value().to_string()),
            (tags::ORDER_QTY, format_qty(order.requested_volume)),
            (tags::TRANSACT_TIME, sending_time()),
        ];
        session
            .send(msg_type::ORDER_CANCEL_REQUEST, fields, true)
            .await?;

        if let Some(rt) = self.runtime.lock().get_mut(order_id) {
            rt.pending_cancel = Some(cancel_cl.clone());
        }
        info!(order_id = %order_id, cl_ord_id = %cancel_cl, "cancel request sent");
        Ok(())
    }

    pub async fn replace(
        &self,
        order_id: &str,
        new_volume: Option<f64>,
        new_price: Option<f64>,
    ) -> Result<(), TradeError> {
        if new_volume.is_none() && new_price.is_none() {
            return Err(TradeError::Validation(
                "replace requires a new volume or price".into(),
            ));
        }
        let order = self
            .store
            .get(order_id)
            .ok_or_else(|| TradeError::OrderNotFound(order_id.to_string()))?;
        if order.status.is_terminal() {
            return Err(TradeError::OrderNotCancelable(format!(
                "{order_id} is {}",
                order.status
            )));
        }
        let (lp, orig_cl) = match (&order.target_lp, &order.cl_ord_id) {
            (Some(lp), Some(cl)) => (lp.clone(), cl.clone()),
            _ => {
                return Err(TradeError::OrderNotCancelable(format!(
                    "{order_id} has no active submission"
                )))
            }
        };
        let session = self.session(&lp)?;

        let replace_cl = new_cl_ord_id();
        self.store.map_cl_ord_id(&replace_cl, order_id);
        let mut fields = vec![
            (tags::CL_ORD_ID, replace_cl.clone()),
            (tags::ORIG_CL_ORD_ID, orig_cl),
            (tags::SYMBOL, order.symbol.clone()),
            (tags::SIDE, order.side.fix_value().to_string()),
            (
                tags::ORDER_QTY,
                format_qty(new_volume.unwrap_or(order.requested_volume)),
            ),
            (tags::ORD_TYPE, order.order_type.fix_value().to_string()),
        ];
        if let Some(price) = new_price.or(order.requested_price) {
            fields.push((tags::PRICE, format_px(price)));
        }
        fields.push((tags::TRANSACT_TIME, sending_time()));
        session
            .send(msg_type::ORDER_CANCEL_REPLACE_REQUEST, fields, true)
            .await?;

        info!(order_id = %order_id, cl_ord_id = %replace_cl, "cancel/replace request sent");
        Ok(())
    }

    /// OrderCancelReject (9): the original order state is unchanged.
    pub fn handle_cancel_reject(&self, lp: &str, msg: &FixMessage) {
        let cl = msg.get(tags::CL_ORD_ID).unwrap_or_default();
        let Some(order_id) = self.store.resolve_cl_ord_id(cl) else {
            warn!(lp = %lp, cl_ord_id = %cl, "cancel reject for unknown ClOrdID");
            return;
        };
        if let Some(rt) = self.runtime.lock().get_mut(&order_id) {
            rt.pending_cancel = None;
        }
        let reason = msg.get(tags::TEXT).unwrap_or("cancel rejected");
        warn!(order_id = %order_id, lp = %lp, reason = %reason, "cancel request rejected — order unchanged");
        self.events.publish(EngineEvent::alert(format!(
            "cancel of order {order_id} rejected by {lp}: {reason}"
        )));
    }

    fn publish_order(&self, order: &Order) {
        self.events.publish(EngineEvent::OrderUpdate {
            account_id: order.account_id.clone(),
            order: order.clone(),
        });
    }
}

impl std::fmt::Debug for ABookEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ABookEngine")
            .field("sessions", &self.sessions.read().len())
            .field("tracked_orders", &self.runtime.lock().len())
            .finish()
    }
}

/// Rejects worth one automatic failover: liquidity/venue conditions that the
/// next LP may not share. Credit or validation problems are final.
fn is_transient_reject(reason: &str) -> bool {
    let upper = reason.to_uppercase();
    ["NO_LIQUIDITY", "NO LIQUIDITY", "TOO LATE", "TOO_LATE", "TIMEOUT", "OFF-TICK"]
        .iter()
        .any(|needle| upper.contains(needle))
}

fn format_qty(qty: f64) -> String {
    format!("{qty:.2}")
}

fn format_px(px: f64) -> String {
    format!("{px:.5}")
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::fix::session::SessionStatus;
    use crate::lp_health::LpHealthTracker;
    use crate::quotes::aggregator::{Quote, QuoteAggregator};
    use crate::runtime_config::{LpConfig, NettingMode};
    use crate::types::{new_id, now_rfc3339, BookKind, Side, TimeInForce};

    struct Fixture {
        engine: Arc<ABookEngine>,
        store: Arc<OrderStore>,
        ledger: Arc<PositionLedger>,
        health: Arc<LpHealthTracker>,
        aggregator: Arc<QuoteAggregator>,
    }

    /// Engine wired against real collaborators, minus live sessions: tests
    /// drive the report path directly.
    fn fixture(lp_ids: &[&str]) -> Fixture {
        let config = Arc::new(RwLock::new(RuntimeConfig {
            lps: lp_ids
                .iter()
                .map(|id| LpConfig {
                    id: id.to_string(),
                    enabled: true,
                    priority: 0,
                    symbols: None,
                })
                .collect(),
            ..Default::default()
        }));
        let events = EventBus::new();
        let health = Arc::new(LpHealthTracker::new(&config.read().sor, 0.01));
        for id in lp_ids {
            health.register(id);
            health.set_session_status(id, SessionStatus::LoggedOn);
        }
        let aggregator = Arc::new(QuoteAggregator::new(
            5_000,
            health.clone(),
            events.clone(),
        ));
        let ledger = Arc::new(PositionLedger::new(NettingMode::Netting, events.clone()));
        ledger.register_account("acc", 1_000_000.0);
        let risk = Arc::new(RiskGate::new(
            config.clone(),
            ledger.clone(),
            aggregator.clone(),
        ));
        let quality = Arc::new(ExecutionQualityRecorder::new(health.clone()));
        let sor = Arc::new(SmartOrderRouter::new(
            aggregator.clone(),
            health.clone(),
            config.clone(),
        ));
        let store = Arc::new(OrderStore::new());
        let bbook = Arc::new(BBookEngine::new(
            config.clone(),
            store.clone(),
            ledger.clone(),
            risk.clone(),
            events.clone(),
        ));
        bbook.attach_aggregator(aggregator.clone());
        let engine = Arc::new(ABookEngine::new(
            config,
            store.clone(),
            sor,
            risk,
            ledger.clone(),
            quality,
            events,
            bbook,
        ));
        Fixture {
            engine,
            store,
            ledger,
            health,
            aggregator,
        }
    }

    fn feed(aggregator: &QuoteAggregator, lp: &str, bid: f64, ask: f64) {
        aggregator.apply_quote(Quote {
            symbol: "EURUSD".into(),
            lp: lp.into(),
            bid,
            ask,
            bid_volume: Some(50.0),
            ask_volume: Some(50.0),
            ts_ms: crate::types::now_ms(),
        });
    }

    /// Insert an order as if the facade had routed it A-book and the wire
    /// submission happened with `cl_ord_id`.
    fn sent_order(f: &Fixture, cl_ord_id: &str, lp: &str, volume: f64) -> String {
        let id = new_id();
        let order = Order {
            id: id.clone(),
            account_id: "acc".into(),
            symbol: "EURUSD".into(),
            side: Side::Buy,
            order_type: crate::types::OrderType::Market,
            requested_volume: volume,
            remaining_volume: volume,
            requested_price: None,
            trigger_price: None,
            time_in_force: TimeInForce::Gtc,
            stop_loss: None,
            take_profit: None,
            routing: BookKind::A,
            target_lp: Some(lp.to_string()),
            hedge_percent: None,
            cl_ord_id: Some(cl_ord_id.to_string()),
            closing_position_id: None,
            status: OrderStatus::Sent,
            created_at: now_rfc3339(),
            sent_at_ms: Some(crate::types::now_ms() - 40),
            last_update_at: now_rfc3339(),
            filled_volume: 0.0,
            avg_fill_price: 0.0,
            partial_fill_count: 0,
            last_reject_reason: None,
        };
        f.store.insert(order);
        f.store.map_cl_ord_id(cl_ord_id, &id);
        f.engine.runtime.lock().insert(
            id.clone(),
            OrderRuntime {
                exec_ids: HashSet::new(),
                candidates: VecDeque::new(),
                reference_price: 1.10020,
                failover_used: false,
                reserved_notional: 0.0,
                pending_cancel: None,
                pip_factor: 10_000.0,
                contract_size: 100_000.0,
            },
        );
        id
    }

    fn report(cl: &str, exec_id: &str, exec_type: &str, extra: Vec<(u32, String)>) -> FixMessage {
        let mut fields = vec![
            (tags::CL_ORD_ID, cl.to_string()),
            (tags::EXEC_ID, exec_id.to_string()),
            (tags::EXEC_TYPE, exec_type.to_string()),
        ];
        fields.extend(extra);
        FixMessage {
            msg_type: "8".into(),
            fields,
        }
    }

    fn fill_report(cl: &str, exec_id: &str, qty: f64, px: f64) -> FixMessage {
        report(
            cl,
            exec_id,
            "F",
            vec![
                (tags::LAST_QTY, qty.to_string()),
                (tags::LAST_PX, px.to_string()),
            ],
        )
    }

    #[tokio::test]
    async fn happy_path_ack_then_fill() {
        let f = fixture(&["X"]);
        let id = sent_order(&f, "c1", "X", 1.0);

        f.engine.handle_exec_report("X", &report("c1", "e0", "0", vec![])).await;
        assert_eq!(f.store.get(&id).unwrap().status, OrderStatus::Acknowledged);

        f.engine
            .handle_exec_report("X", &fill_report("c1", "e1", 1.0, 1.10020))
            .await;

        let order = f.store.get(&id).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.filled_volume, 1.0);
        assert_eq!(order.remaining_volume, 0.0);
        assert_eq!(order.avg_fill_price, 1.10020);

        let positions = f.ledger.open_positions("acc");
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, Side::Buy);
        assert_eq!(positions[0].volume, 1.0);
        assert_eq!(positions[0].open_price, 1.10020);
    }

    #[tokio::test]
    async fn partial_fills_vwap_and_count() {
        let f = fixture(&["X"]);
        let id = sent_order(&f, "c1", "X", 1.0);

        f.engine.handle_exec_report("X", &report("c1", "e0", "0", vec![])).await;
        f.engine
            .handle_exec_report("X", &fill_report("c1", "e1", 0.4, 1.10020))
            .await;
        assert_eq!(
            f.store.get(&id).unwrap().status,
            OrderStatus::PartiallyFilled
        );
        f.engine
            .handle_exec_report("X", &fill_report("c1", "e2", 0.3, 1.10021))
            .await;
        f.engine
            .handle_exec_report("X", &fill_report("c1", "e3", 0.3, 1.10022))
            .await;

        let order = f.store.get(&id).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.partial_fill_count, 3);
        let expected_vwap = 0.4 * 1.10020 + 0.3 * 1.10021 + 0.3 * 1.10022;
        assert!((order.avg_fill_price - expected_vwap).abs() < 1e-9);
        assert!((order.filled_volume - 1.0).abs() < 1e-9);

        // Netting merged the partials into one position at the VWAP.
        let positions = f.ledger.open_positions("acc");
        assert_eq!(positions.len(), 1);
        assert!((positions[0].volume - 1.0).abs() < 1e-9);
        assert!((positions[0].open_price - expected_vwap).abs() < 1e-9);
    }

    #[tokio::test]
    async fn duplicate_exec_id_is_a_no_op() {
        let f = fixture(&["X"]);
        let id = sent_order(&f, "c1", "X", 1.0);

        let fill = fill_report("c1", "e1", 0.4, 1.10020);
        f.engine.handle_exec_report("X", &fill).await;
        f.engine.handle_exec_report("X", &fill).await;
        f.engine.handle_exec_report("X", &fill).await;

        let order = f.store.get(&id).unwrap();
        assert!((order.filled_volume - 0.4).abs() < 1e-9);
        assert_eq!(order.partial_fill_count, 1);

        let positions = f.ledger.open_positions("acc");
        assert_eq!(positions.len(), 1);
        assert!((positions[0].volume - 0.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn unsolicited_report_creates_nothing() {
        let f = fixture(&["X"]);
        f.engine
            .handle_exec_report("X", &fill_report("ghost", "e1", 1.0, 1.1))
            .await;
        assert!(f.store.is_empty());
        assert!(f.ledger.open_positions("acc").is_empty());
    }

    #[tokio::test]
    async fn reject_without_candidates_is_terminal() {
        let f = fixture(&["X"]);
        let id = sent_order(&f, "c1", "X", 1.0);

        f.engine
            .handle_exec_report(
                "X",
                &report(
                    "c1",
                    "e1",
                    "8",
                    vec![(tags::TEXT, "NO_LIQUIDITY".to_string())],
                ),
            )
            .await;

        let order = f.store.get(&id).unwrap();
        assert_eq!(order.status, OrderStatus::Rejected);
        assert!(order
            .last_reject_reason
            .as_deref()
            .unwrap()
            .contains("NO_LIQUIDITY"));
        assert!(f.ledger.open_positions("acc").is_empty());
    }

    #[tokio::test]
    async fn reports_after_terminal_are_ignored() {
        let f = fixture(&["X"]);
        let id = sent_order(&f, "c1", "X", 1.0);

        f.engine
            .handle_exec_report("X", &fill_report("c1", "e1", 1.0, 1.10020))
            .await;
        assert_eq!(f.store.get(&id).unwrap().status, OrderStatus::Filled);

        // A delayed (resent) cancel confirmation must not unfreeze the order.
        f.engine.handle_exec_report("X", &report("c1", "e2", "4", vec![])).await;
        let order = f.store.get(&id).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(f.ledger.open_positions("acc").len(), 1);
    }

    #[tokio::test]
    async fn cancel_confirmation_terminalizes() {
        let f = fixture(&["X"]);
        let id = sent_order(&f, "c1", "X", 1.0);

        f.engine.handle_exec_report("X", &report("c1", "e0", "0", vec![])).await;
        f.engine.handle_exec_report("X", &report("c1", "e1", "4", vec![])).await;

        assert_eq!(f.store.get(&id).unwrap().status, OrderStatus::Canceled);
        assert!(f.ledger.open_positions("acc").is_empty());
    }

    #[tokio::test]
    async fn cancel_reject_leaves_state_unchanged() {
        let f = fixture(&["X"]);
        let id = sent_order(&f, "c1", "X", 1.0);
        f.engine.handle_exec_report("X", &report("c1", "e0", "0", vec![])).await;

        let reject = FixMessage {
            msg_type: "9".into(),
            fields: vec![
                (tags::CL_ORD_ID, "c1".to_string()),
                (tags::ORIG_CL_ORD_ID, "c0".to_string()),
                (tags::TEXT, "too late to cancel".to_string()),
            ],
        };
        f.engine.handle_cancel_reject("X", &reject);
        assert_eq!(f.store.get(&id).unwrap().status, OrderStatus::Acknowledged);
    }

    #[tokio::test]
    async fn close_order_fill_reduces_position() {
        let f = fixture(&["X"]);
        // Open 1.0 lot via a first order.
        let open_id = sent_order(&f, "c1", "X", 1.0);
        f.engine
            .handle_exec_report("X", &fill_report("c1", "e1", 1.0, 1.10020))
            .await;
        let position = f.ledger.open_positions("acc").remove(0);
        assert!(f.store.get(&open_id).is_some());

        // Closing order referencing the position.
        let close_id = sent_order(&f, "c2", "X", 1.0);
        f.store.update(&close_id, |o| {
            o.side = Side::Sell;
            o.closing_position_id = Some(position.id.clone());
        });
        f.engine
            .handle_exec_report("X", &fill_report("c2", "e2", 1.0, 1.10120))
            .await;

        assert!(f.ledger.open_positions("acc").is_empty());
        let closed = f.ledger.find_position(&position.id).unwrap();
        assert!((closed.realized_pnl - 100.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn submit_fails_fast_without_sessions() {
        let f = fixture(&["X"]);
        feed(&f.aggregator, "X", 1.1000, 1.1002);

        let id = new_id();
        let order = Order {
            id: id.clone(),
            account_id: "acc".into(),
            symbol: "EURUSD".into(),
            side: Side::Buy,
            order_type: crate::types::OrderType::Market,
            requested_volume: 1.0,
            remaining_volume: 1.0,
            requested_price: None,
            trigger_price: None,
            time_in_force: TimeInForce::Gtc,
            stop_loss: None,
            take_profit: None,
            routing: BookKind::A,
            target_lp: None,
            hedge_percent: None,
            cl_ord_id: None,
            closing_position_id: None,
            status: OrderStatus::Routed,
            created_at: now_rfc3339(),
            sent_at_ms: None,
            last_update_at: now_rfc3339(),
            filled_volume: 0.0,
            avg_fill_price: 0.0,
            partial_fill_count: 0,
            last_reject_reason: None,
        };
        f.store.insert(order);

        // No FIX session registered: every candidate fails, NoEligibleLP.
        let err = f.engine.submit(&id, None, 0.0).await.unwrap_err();
        assert!(matches!(err, TradeError::NoEligibleLp(_)));
    }

    #[tokio::test]
    async fn lp_health_reflects_rejects_through_quality() {
        let f = fixture(&["X"]);
        let _ = &f.health;
        for i in 0..3 {
            let cl = format!("c{i}");
            sent_order(&f, &cl, "X", 1.0);
            f.engine
                .handle_exec_report(
                    "X",
                    &report(&cl, "e1", "8", vec![(tags::TEXT, "NO_LIQUIDITY".into())]),
                )
                .await;
        }
        // Three consecutive rejects quarantine the LP.
        assert!(f.health.is_quarantined("X"));
    }

    #[test]
    fn transient_classification() {
        assert!(is_transient_reject("NO_LIQUIDITY"));
        assert!(is_transient_reject("no liquidity at requested size"));
        assert!(is_transient_reject("too late to enter"));
        assert!(!is_transient_reject("insufficient credit"));
        assert!(!is_transient_reject("unknown symbol"));
    }
}

// =============================================================================
// Execution Engine — facade over the A-book and B-book paths
// =============================================================================
//
// PlaceOrder pipeline, in order:
//   1. validate the request shape,
//   2. assign the OrderID and publish NEW,
//   3. run the pre-trade risk chain (reserves notional on success),
//   4. evaluate the routing rules,
//   5. dispatch: B-book internalizes synchronously, A-book selects an LP and
//      goes to the wire, C-book internalizes the unhedged fraction and sends
//      the rest upstream.
//
// Pre-trade failures mark the order REJECTED and never touch the ledger.
// The shared OrderStore is the single holder of order state; fills and state
// transitions are applied under its write lock so observers only ever see
// consistent (filled_volume, remaining_volume, status) triples.
// =============================================================================

pub mod abook;
pub mod bbook;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::errors::TradeError;
use crate::events::{EngineEvent, EventBus};
use crate::exec_quality::ExecutionQualityRecorder;
use crate::fix::message::{msg_type, FixMessage};
use crate::fix::session::FixSessionHandle;
use crate::position_ledger::PositionLedger;
use crate::risk_gate::RiskGate;
use crate::routing;
use crate::runtime_config::RuntimeConfig;
use crate::sor::SmartOrderRouter;
use crate::types::{
    new_id, now_rfc3339, BookKind, Order, OrderRequest, OrderStatus, OrderType, Side,
};

// ---------------------------------------------------------------------------
// Order store
// ---------------------------------------------------------------------------

/// Owner of all order state. ClOrdIDs (one per wire submission) map onto the
/// stable server OrderID.
pub struct OrderStore {
    orders: RwLock<HashMap<String, Order>>,
    by_cl_ord_id: RwLock<HashMap<String, String>>,
}

impl OrderStore {
    pub fn new() -> Self {
        Self {
            orders: RwLock::new(HashMap::new()),
            by_cl_ord_id: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, order: Order) {
        self.orders.write().insert(order.id.clone(), order);
    }

    pub fn get(&self, order_id: &str) -> Option<Order> {
        self.orders.read().get(order_id).cloned()
    }

    /// Mutate an order under the write lock; returns the updated clone.
    /// Terminal orders are immutable — the closure is not invoked for them.
    pub fn update(&self, order_id: &str, f: impl FnOnce(&mut Order)) -> Option<Order> {
        let mut orders = self.orders.write();
        let order = orders.get_mut(order_id)?;
        if order.status.is_terminal() {
            return Some(order.clone());
        }
        f(order);
        order.last_update_at = now_rfc3339();
        Some(order.clone())
    }

    /// Bind a wire ClOrdID to an order.
    pub fn map_cl_ord_id(&self, cl_ord_id: &str, order_id: &str) {
        self.by_cl_ord_id
            .write()
            .insert(cl_ord_id.to_string(), order_id.to_string());
    }

    pub fn resolve_cl_ord_id(&self, cl_ord_id: &str) -> Option<String> {
        self.by_cl_ord_id.read().get(cl_ord_id).cloned()
    }

    pub fn orders_for_account(&self, account_id: &str) -> Vec<Order> {
        let mut out: Vec<Order> = self
            .orders
            .read()
            .values()
            .filter(|o| o.account_id == account_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    pub fn len(&self) -> usize {
        self.orders.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.read().is_empty()
    }
}

impl Default for OrderStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OrderStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderStore")
            .field("orders", &self.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Facade
// ---------------------------------------------------------------------------

/// The execution engine: entry point for order placement, cancelation and
/// position close.
pub struct ExecutionEngine {
    config: Arc<RwLock<RuntimeConfig>>,
    pub store: Arc<OrderStore>,
    risk: Arc<RiskGate>,
    ledger: Arc<PositionLedger>,
    events: EventBus,
    pub abook: Arc<abook::ABookEngine>,
    pub bbook: Arc<bbook::BBookEngine>,
}

impl ExecutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<RwLock<RuntimeConfig>>,
        risk: Arc<RiskGate>,
        ledger: Arc<PositionLedger>,
        quality: Arc<ExecutionQualityRecorder>,
        sor: Arc<SmartOrderRouter>,
        events: EventBus,
    ) -> Self {
        let store = Arc::new(OrderStore::new());
        let bbook = Arc::new(bbook::BBookEngine::new(
            config.clone(),
            store.clone(),
            ledger.clone(),
            risk.clone(),
            events.clone(),
        ));
        let abook = Arc::new(abook::ABookEngine::new(
            config.clone(),
            store.clone(),
            sor,
            risk.clone(),
            ledger.clone(),
            quality,
            events.clone(),
            bbook.clone(),
        ));
        Self {
            config,
            store,
            risk,
            ledger,
            events,
            abook,
            bbook,
        }
    }

    /// Make a FIX session available to the A-book path.
    pub fn register_session(&self, handle: FixSessionHandle) {
        self.abook.register_session(handle);
    }

    // -------------------------------------------------------------------------
    // PlaceOrder
    // -------------------------------------------------------------------------

    pub async fn place_order(&self, req: OrderRequest) -> Result<String, TradeError> {
        validate_request(&req)?;

        let account_cfg = self.config.read().account(&req.account_id);
        self.ledger
            .register_account(&req.account_id, account_cfg.starting_balance);

        let order = Order {
            id: new_id(),
            account_id: req.account_id.clone(),
            symbol: req.symbol.clone(),
            side: req.side,
            order_type: req.order_type,
            requested_volume: req.volume,
            remaining_volume: req.volume,
            requested_price: req.price,
            trigger_price: req.trigger_price,
            time_in_force: req.time_in_force,
            stop_loss: req.stop_loss,
            take_profit: req.take_profit,
            routing: BookKind::B,
            target_lp: None,
            hedge_percent: None,
            cl_ord_id: None,
            closing_position_id: req.closing_position_id.clone(),
            status: OrderStatus::New,
            created_at: now_rfc3339(),
            sent_at_ms: None,
            last_update_at: now_rfc3339(),
            filled_volume: 0.0,
            avg_fill_price: 0.0,
            partial_fill_count: 0,
            last_reject_reason: None,
        };
        let order_id = order.id.clone();
        self.store.insert(order.clone());
        self.publish_order(&order);

        info!(
            order_id = %order_id,
            account = %req.account_id,
            symbol = %req.symbol,
            side = %req.side,
            order_type = %req.order_type,
            volume = req.volume,
            "order accepted for processing"
        );

        // Pre-trade risk. Failures are synchronous and leave the ledger
        // untouched.
        let reserved = match self.risk.check_and_reserve(&req) {
            Ok(notional) => notional,
            Err(e) => {
                self.reject_pre_trade(&order_id, &e);
                return Err(e);
            }
        };

        // Routing decision.
        let rules = self.config.read().routing_rules.clone();
        let target = match routing::decide(&rules, &account_cfg.group, &req.symbol, req.volume)
        {
            Ok(target) => target,
            Err(e) => {
                self.risk.release(&req.account_id, reserved);
                self.reject_pre_trade(&order_id, &e);
                return Err(e);
            }
        };

        if let Some(updated) = self.store.update(&order_id, |o| {
            o.routing = target.book;
            o.hedge_percent = target.hedge_percent;
            o.status = OrderStatus::Routed;
        }) {
            self.publish_order(&updated);
        }

        // Dispatch.
        let dispatch = match target.book {
            BookKind::B => self.bbook.execute(&order_id, reserved),
            BookKind::A => {
                self.abook
                    .submit(&order_id, target.target_lp.as_deref(), reserved)
                    .await
            }
            BookKind::C => {
                let hedge = target.hedge_percent.unwrap_or(1.0).clamp(0.0, 1.0);
                if hedge <= 0.0 {
                    // Degenerate rule: nothing to hedge, plain internalization.
                    self.bbook.execute(&order_id, reserved)
                } else {
                    let internal = req.volume * (1.0 - hedge);
                    let internal_result = if internal > 0.0 {
                        self.bbook.apply_internal_fraction(&order_id, internal)
                    } else {
                        Ok(())
                    };
                    match internal_result {
                        Ok(()) => {
                            self.abook
                                .submit(&order_id, target.target_lp.as_deref(), reserved)
                                .await
                        }
                        Err(e) => Err(e),
                    }
                }
            }
        };

        match dispatch {
            Ok(()) => Ok(order_id),
            Err(e) => {
                self.risk.release(&req.account_id, reserved);
                let rejected = self.store.update(&order_id, |o| {
                    if o.status.can_transition_to(OrderStatus::Rejected) {
                        o.status = OrderStatus::Rejected;
                        o.last_reject_reason = Some(e.to_string());
                    }
                });
                if let Some(o) = rejected {
                    self.publish_order(&o);
                }
                Err(e)
            }
        }
    }

    fn reject_pre_trade(&self, order_id: &str, error: &TradeError) {
        warn!(order_id = %order_id, kind = error.kind(), error = %error, "pre-trade rejection");
        if let Some(order) = self.store.update(order_id, |o| {
            o.status = OrderStatus::Rejected;
            o.last_reject_reason = Some(error.to_string());
        }) {
            self.publish_order(&order);
        }
    }

    // -------------------------------------------------------------------------
    // Cancel / close
    // -------------------------------------------------------------------------

    pub async fn cancel_order(&self, order_id: &str) -> Result<(), TradeError> {
        let order = self
            .store
            .get(order_id)
            .ok_or_else(|| TradeError::OrderNotFound(order_id.to_string()))?;
        match order.routing {
            BookKind::A | BookKind::C => self.abook.cancel(order_id).await,
            BookKind::B => self.bbook.cancel(order_id),
        }
    }

    /// Cancel/replace for working A-book orders (price and/or volume).
    pub async fn replace_order(
        &self,
        order_id: &str,
        new_volume: Option<f64>,
        new_price: Option<f64>,
    ) -> Result<(), TradeError> {
        let order = self
            .store
            .get(order_id)
            .ok_or_else(|| TradeError::OrderNotFound(order_id.to_string()))?;
        match order.routing {
            BookKind::A | BookKind::C => {
                self.abook.replace(order_id, new_volume, new_price).await
            }
            BookKind::B => Err(TradeError::Validation(
                "replace is only supported for externalized orders".into(),
            )),
        }
    }

    /// Close (part of) a position by submitting an opposite-side market
    /// order. Returns the closing order's id.
    pub async fn close_position(
        &self,
        position_id: &str,
        volume: Option<f64>,
    ) -> Result<String, TradeError> {
        let position = self
            .ledger
            .find_position(position_id)
            .ok_or_else(|| TradeError::PositionNotFound(position_id.to_string()))?;
        if position.volume <= 0.0 {
            return Err(TradeError::PositionNotFound(format!(
                "{position_id} is already closed"
            )));
        }
        let close_volume = volume.unwrap_or(position.volume).min(position.volume);

        let req = OrderRequest {
            account_id: position.account_id.clone(),
            symbol: position.symbol.clone(),
            side: position.side.opposite(),
            order_type: OrderType::Market,
            volume: close_volume,
            price: None,
            trigger_price: None,
            time_in_force: Default::default(),
            stop_loss: None,
            take_profit: None,
            closing_position_id: Some(position_id.to_string()),
        };
        self.place_order(req).await
    }

    // -------------------------------------------------------------------------
    // Inbound FIX application traffic
    // -------------------------------------------------------------------------

    /// Entry point for the session layer's application messages.
    pub async fn on_app_message(&self, lp: &str, msg: &FixMessage) {
        match msg.msg_type.as_str() {
            msg_type::EXECUTION_REPORT => self.abook.handle_exec_report(lp, msg).await,
            msg_type::ORDER_CANCEL_REJECT => self.abook.handle_cancel_reject(lp, msg),
            other => {
                warn!(lp = %lp, msg_type = other, "unexpected app message type");
            }
        }
    }

    pub fn get_order(&self, order_id: &str) -> Option<Order> {
        self.store.get(order_id)
    }

    fn publish_order(&self, order: &Order) {
        self.events.publish(EngineEvent::OrderUpdate {
            account_id: order.account_id.clone(),
            order: order.clone(),
        });
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("orders", &self.store.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Request validation
// ---------------------------------------------------------------------------

fn validate_request(req: &OrderRequest) -> Result<(), TradeError> {
    if req.account_id.is_empty() || req.symbol.is_empty() {
        return Err(TradeError::Validation(
            "account_id and symbol are required".into(),
        ));
    }
    if !req.volume.is_finite() || req.volume <= 0.0 {
        return Err(TradeError::Validation(format!(
            "volume {} must be positive",
            req.volume
        )));
    }
    match req.order_type {
        OrderType::Limit | OrderType::StopLimit => {
            if !req.price.is_some_and(|p| p > 0.0) {
                return Err(TradeError::Validation(
                    "limit orders require a positive price".into(),
                ));
            }
        }
        OrderType::Market | OrderType::Stop => {}
    }
    match req.order_type {
        OrderType::Stop | OrderType::StopLimit => {
            if !req.trigger_price.is_some_and(|p| p > 0.0) {
                return Err(TradeError::Validation(
                    "stop orders require a positive trigger price".into(),
                ));
            }
        }
        _ => {}
    }
    if let (Some(sl), Some(tp)) = (req.stop_loss, req.take_profit) {
        let inverted = match req.side {
            Side::Buy => sl >= tp,
            Side::Sell => sl <= tp,
        };
        if inverted {
            return Err(TradeError::Validation(
                "stop loss and take profit are inverted for this side".into(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TimeInForce;

    fn request() -> OrderRequest {
        OrderRequest {
            account_id: "acc".into(),
            symbol: "EURUSD".into(),
            side: Side::Buy,
            order_type: OrderType::Market,
            volume: 1.0,
            price: None,
            trigger_price: None,
            time_in_force: TimeInForce::Gtc,
            stop_loss: None,
            take_profit: None,
            closing_position_id: None,
        }
    }

    #[test]
    fn market_request_is_valid() {
        validate_request(&request()).unwrap();
    }

    #[test]
    fn zero_volume_is_invalid() {
        let mut req = request();
        req.volume = 0.0;
        assert!(validate_request(&req).is_err());
    }

    #[test]
    fn limit_requires_price() {
        let mut req = request();
        req.order_type = OrderType::Limit;
        assert!(validate_request(&req).is_err());
        req.price = Some(1.1);
        validate_request(&req).unwrap();
    }

    #[test]
    fn stop_requires_trigger() {
        let mut req = request();
        req.order_type = OrderType::Stop;
        assert!(validate_request(&req).is_err());
        req.trigger_price = Some(1.2);
        validate_request(&req).unwrap();
    }

    #[test]
    fn inverted_sl_tp_rejected() {
        let mut req = request();
        req.stop_loss = Some(1.2);
        req.take_profit = Some(1.1);
        assert!(validate_request(&req).is_err());
        // Correct for a long: SL below TP.
        req.stop_loss = Some(1.05);
        validate_request(&req).unwrap();
    }

    #[test]
    fn cl_ord_id_mapping_resolves() {
        let store = OrderStore::new();
        store.map_cl_ord_id("c1", "order-1");
        assert_eq!(store.resolve_cl_ord_id("c1").as_deref(), Some("order-1"));
        assert_eq!(store.resolve_cl_ord_id("unknown"), None);
    }

    #[test]
    fn terminal_orders_are_immutable_in_store() {
        let store = OrderStore::new();
        let mut order = Order {
            id: "o1".into(),
            account_id: "acc".into(),
            symbol: "EURUSD".into(),
            side: Side::Buy,
            order_type: OrderType::Market,
            requested_volume: 1.0,
            remaining_volume: 0.0,
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
            status: OrderStatus::Filled,
            created_at: now_rfc3339(),
            sent_at_ms: None,
            last_update_at: now_rfc3339(),
            filled_volume: 1.0,
            avg_fill_price: 1.1,
            partial_fill_count: 1,
            last_reject_reason: None,
        };
        order.status = OrderStatus::Filled;
        store.insert(order);

        let after = store
            .update("o1", |o| o.filled_volume = 99.0)
            .unwrap();
        assert_eq!(after.filled_volume, 1.0, "terminal order must not change");
    }
}

// =============================================================================
// B-Book Execution Engine — synchronous internalization
// =============================================================================
//
// Market orders fill immediately against the aggregated top-of-book plus the
// configured markup; the platform is the counterparty. Limit and stop orders
// park and are re-evaluated on every aggregated-quote tick for their symbol.
//
// Trigger evaluation is serialized per symbol: a dispatcher subscribes to the
// engine event stream and feeds one task per symbol, so orders whose triggers
// cross in the same tick fill in FIFO parking order. The same per-symbol pass
// evaluates stop-loss / take-profit exits for internalized positions.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::TradeError;
use crate::events::{EngineEvent, EventBus};
use crate::execution::OrderStore;
use crate::position_ledger::PositionLedger;
use crate::quotes::aggregator::{QuoteAggregator, TopOfBook};
use crate::risk_gate::RiskGate;
use crate::runtime_config::RuntimeConfig;
use crate::types::{Order, OrderStatus, OrderType, Side, TimeInForce};

const EPS: f64 = 1e-9;

/// Stop-loss / take-profit watch for one internalized position.
#[derive(Debug, Clone)]
pub struct ExitParams {
    pub position_id: String,
    pub account_id: String,
    pub symbol: String,
    pub side: Side,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

/// The internalization engine.
pub struct BBookEngine {
    config: Arc<RwLock<RuntimeConfig>>,
    store: Arc<OrderStore>,
    ledger: Arc<PositionLedger>,
    risk: Arc<RiskGate>,
    events: EventBus,
    aggregator: RwLock<Option<Arc<QuoteAggregator>>>,
    /// symbol → parked order ids, FIFO.
    parked: RwLock<HashMap<String, VecDeque<String>>>,
    /// Stop-limit orders whose trigger has crossed (now working as limits).
    triggered: RwLock<HashSet<String>>,
    /// Risk reservations held by parked orders.
    reservations: RwLock<HashMap<String, f64>>,
    /// position id → exit watch.
    exits: RwLock<HashMap<String, ExitParams>>,
}

impl BBookEngine {
    pub fn new(
        config: Arc<RwLock<RuntimeConfig>>,
        store: Arc<OrderStore>,
        ledger: Arc<PositionLedger>,
        risk: Arc<RiskGate>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            store,
            ledger,
            risk,
            events,
            aggregator: RwLock::new(None),
            parked: RwLock::new(HashMap::new()),
            triggered: RwLock::new(HashSet::new()),
            reservations: RwLock::new(HashMap::new()),
            exits: RwLock::new(HashMap::new()),
        }
    }

    /// Wire the aggregator in after construction (it is built first and does
    /// not depend on the engines).
    pub fn attach_aggregator(&self, aggregator: Arc<QuoteAggregator>) {
        *self.aggregator.write() = Some(aggregator);
    }

    fn book(&self, symbol: &str) -> Result<TopOfBook, TradeError> {
        let aggregator = self
            .aggregator
            .read()
            .clone()
            .ok_or_else(|| TradeError::NoPrice("aggregator not attached".into()))?;
        Ok(aggregator.top_of_book(symbol))
    }

    /// Client fill price for a side: markup widens the book against the
    /// client.
    fn client_price(&self, symbol: &str, side: Side, book: &TopOfBook) -> Option<(f64, Option<f64>)> {
        let sym = self.config.read().symbol(symbol);
        let markup = sym.markup_pips / sym.pip_factor;
        match side {
            Side::Buy => book.ask.as_ref().map(|a| (a.price + markup, a.volume)),
            Side::Sell => book.bid.as_ref().map(|b| (b.price - markup, b.volume)),
        }
    }

    // -------------------------------------------------------------------------
    // Entry points from the facade
    // -------------------------------------------------------------------------

    /// Execute a B-routed order: market orders fill now, resting orders park.
    pub fn execute(&self, order_id: &str, reserved: f64) -> Result<(), TradeError> {
        let order = self
            .store
            .get(order_id)
            .ok_or_else(|| TradeError::OrderNotFound(order_id.to_string()))?;

        match order.order_type {
            OrderType::Market => {
                let book = self.book(&order.symbol)?;
                let (price, shown) = self
                    .client_price(&order.symbol, order.side, &book)
                    .ok_or_else(|| TradeError::NoPrice(order.symbol.clone()))?;
                if order.time_in_force == TimeInForce::Fok {
                    if let Some(shown) = shown {
                        if shown < order.remaining_volume {
                            return Err(TradeError::NoPrice(format!(
                                "FOK: displayed volume {shown} below {}",
                                order.remaining_volume
                            )));
                        }
                    }
                }
                self.fill_full(&order, price);
                self.risk.release(&order.account_id, reserved);
                Ok(())
            }
            OrderType::Limit => {
                let book = self.book(&order.symbol)?;
                if let Some(price) = self.executable_limit_price(&order, &book) {
                    self.fill_full(&order, price);
                    self.risk.release(&order.account_id, reserved);
                    return Ok(());
                }
                match order.time_in_force {
                    TimeInForce::Gtc => self.park(&order, reserved),
                    TimeInForce::Ioc | TimeInForce::Fok => self.expire(&order, reserved),
                }
                Ok(())
            }
            OrderType::Stop | OrderType::StopLimit => {
                // Stops always park; IOC/FOK semantics apply at trigger time.
                self.park(&order, reserved);
                Ok(())
            }
        }
    }

    /// C-book support: internalize a fraction of the order immediately. The
    /// order stays non-terminal; the A-book path carries the rest.
    pub fn apply_internal_fraction(
        &self,
        order_id: &str,
        volume: f64,
    ) -> Result<(), TradeError> {
        let order = self
            .store
            .get(order_id)
            .ok_or_else(|| TradeError::OrderNotFound(order_id.to_string()))?;
        let book = self.book(&order.symbol)?;
        let (price, _) = self
            .client_price(&order.symbol, order.side, &book)
            .ok_or_else(|| TradeError::NoPrice(order.symbol.clone()))?;

        self.apply_fill(&order.id, volume.min(order.remaining_volume), price, false);
        debug!(
            order_id = %order.id,
            volume,
            price,
            "internalized hedge remainder"
        );
        Ok(())
    }

    /// Cancel a parked order. Market orders fill synchronously and can never
    /// be canceled here.
    pub fn cancel(&self, order_id: &str) -> Result<(), TradeError> {
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

        let was_parked = {
            let mut parked = self.parked.write();
            match parked.get_mut(&order.symbol) {
                Some(queue) => {
                    let before = queue.len();
                    queue.retain(|id| id != order_id);
                    before != queue.len()
                }
                None => false,
            }
        };
        if !was_parked {
            return Err(TradeError::OrderNotCancelable(format!(
                "{order_id} is not resting"
            )));
        }

        self.triggered.write().remove(order_id);
        if let Some(reserved) = self.reservations.write().remove(order_id) {
            self.risk.release(&order.account_id, reserved);
        }
        if let Some(updated) = self.store.update(order_id, |o| {
            o.status = OrderStatus::Canceled;
        }) {
            self.publish_order(&updated);
        }
        info!(order_id = %order_id, "parked order canceled");
        Ok(())
    }

    /// Register an SL/TP watch for a freshly opened position.
    pub fn register_exits(&self, params: ExitParams) {
        if params.stop_loss.is_none() && params.take_profit.is_none() {
            return;
        }
        debug!(
            position_id = %params.position_id,
            sl = ?params.stop_loss,
            tp = ?params.take_profit,
            "exit watch registered"
        );
        self.exits
            .write()
            .insert(params.position_id.clone(), params);
    }

    // -------------------------------------------------------------------------
    // Fill plumbing
    // -------------------------------------------------------------------------

    fn park(&self, order: &Order, reserved: f64) {
        self.reservations
            .write()
            .insert(order.id.clone(), reserved);
        self.parked
            .write()
            .entry(order.symbol.clone())
            .or_default()
            .push_back(order.id.clone());
        if let Some(updated) = self.store.update(&order.id, |o| {
            if o.status.can_transition_to(OrderStatus::Acknowledged) {
                o.status = OrderStatus::Acknowledged;
            }
        }) {
            self.publish_order(&updated);
        }
        info!(
            order_id = %order.id,
            symbol = %order.symbol,
            order_type = %order.order_type,
            "order parked for trigger evaluation"
        );
    }

    fn expire(&self, order: &Order, reserved: f64) {
        self.risk.release(&order.account_id, reserved);
        if let Some(updated) = self.store.update(&order.id, |o| {
            if o.status.can_transition_to(OrderStatus::Expired) {
                o.status = OrderStatus::Expired;
                o.last_reject_reason = Some(format!("{} not immediately executable", o.time_in_force));
            }
        }) {
            self.publish_order(&updated);
        }
    }

    /// Fill the whole remaining volume at `price` and finish the order.
    fn fill_full(&self, order: &Order, price: f64) {
        self.apply_fill(&order.id, order.remaining_volume, price, true);
    }

    /// Apply a (partial or full) internal fill: order state, ledger, exits.
    fn apply_fill(&self, order_id: &str, volume: f64, price: f64, terminal_if_filled: bool) {
        let Some(updated) = self.store.update(order_id, |o| {
            let qty = volume.min(o.remaining_volume);
            let new_filled = o.filled_volume + qty;
            if new_filled > EPS {
                o.avg_fill_price =
                    (o.avg_fill_price * o.filled_volume + price * qty) / new_filled;
            }
            o.filled_volume = new_filled;
            o.remaining_volume = (o.requested_volume - new_filled).max(0.0);
            o.partial_fill_count += 1;
            if terminal_if_filled && o.remaining_volume <= EPS {
                o.status = OrderStatus::Filled;
            }
        }) else {
            warn!(order_id = %order_id, "fill for unknown order dropped");
            return;
        };

        self.apply_to_ledger(&updated, volume, price);
        self.publish_order(&updated);

        if updated.status == OrderStatus::Filled {
            info!(
                order_id = %order_id,
                volume = updated.filled_volume,
                avg_price = updated.avg_fill_price,
                "order internalized"
            );
        }
    }

    /// Ledger side of a fill: open or close, plus realized-PnL feedback and
    /// exit registration.
    fn apply_to_ledger(&self, order: &Order, volume: f64, price: f64) {
        let sym = self.config.read().symbol(&order.symbol);
        match &order.closing_position_id {
            Some(position_id) => {
                match self
                    .ledger
                    .apply_close_fill(&order.account_id, position_id, volume, price)
                {
                    Ok(outcome) => {
                        self.risk.on_realized(&order.account_id, outcome.realized_pnl);
                        if outcome.fully_closed {
                            self.exits.write().remove(position_id);
                        }
                    }
                    Err(e) => {
                        warn!(
                            order_id = %order.id,
                            position_id = %position_id,
                            error = %e,
                            "closing fill could not be applied"
                        );
                    }
                }
            }
            None => {
                let position = self.ledger.apply_open_fill(
                    &order.account_id,
                    &order.symbol,
                    order.side,
                    volume,
                    price,
                    sym.contract_size,
                    &order.id,
                );
                self.register_exits(ExitParams {
                    position_id: position.id.clone(),
                    account_id: order.account_id.clone(),
                    symbol: order.symbol.clone(),
                    side: position.side,
                    stop_loss: order.stop_loss,
                    take_profit: order.take_profit,
                });
            }
        }
    }

    // -------------------------------------------------------------------------
    // Quote-driven trigger evaluation
    // -------------------------------------------------------------------------

    /// Is a (possibly triggered) limit order executable at this book?
    fn executable_limit_price(&self, order: &Order, book: &TopOfBook) -> Option<f64> {
        let limit = order.requested_price?;
        let (price, _) = self.client_price(&order.symbol, order.side, book)?;
        let ok = match order.side {
            Side::Buy => price <= limit,
            Side::Sell => price >= limit,
        };
        ok.then_some(price)
    }

    fn stop_triggered(&self, order: &Order, book: &TopOfBook) -> bool {
        let Some(trigger) = order.trigger_price else {
            return false;
        };
        // Stops trigger on the price the client would trade at next.
        let reference = match order.side {
            Side::Buy => book.ask.as_ref().map(|a| a.price),
            Side::Sell => book.bid.as_ref().map(|b| b.price),
        };
        match (order.side, reference) {
            (Side::Buy, Some(p)) => p >= trigger,
            (Side::Sell, Some(p)) => p <= trigger,
            _ => false,
        }
    }

    /// One trigger pass for a symbol. Parked orders are evaluated in FIFO
    /// order; orders that do not fire stay parked in their original order.
    pub fn on_book_update(&self, symbol: &str, book: &TopOfBook) {
        let queue: Vec<String> = {
            let parked = self.parked.read();
            match parked.get(symbol) {
                Some(q) => q.iter().cloned().collect(),
                None => Vec::new(),
            }
        };

        let mut remaining: VecDeque<String> = VecDeque::new();
        for order_id in queue {
            let Some(order) = self.store.get(&order_id) else {
                continue;
            };
            if order.status.is_terminal() {
                continue;
            }

            let fire_price = match order.order_type {
                OrderType::Limit => self.executable_limit_price(&order, book),
                OrderType::Stop => {
                    if self.stop_triggered(&order, book) {
                        self.client_price(symbol, order.side, book).map(|(p, _)| p)
                    } else {
                        None
                    }
                }
                OrderType::StopLimit => {
                    let already = self.triggered.read().contains(&order_id);
                    if already || self.stop_triggered(&order, book) {
                        self.triggered.write().insert(order_id.clone());
                        self.executable_limit_price(&order, book)
                    } else {
                        None
                    }
                }
                OrderType::Market => None,
            };

            match fire_price {
                Some(price) => {
                    self.fill_full(&order, price);
                    self.triggered.write().remove(&order_id);
                    if let Some(reserved) = self.reservations.write().remove(&order_id) {
                        self.risk.release(&order.account_id, reserved);
                    }
                }
                None => remaining.push_back(order_id),
            }
        }

        {
            let mut parked = self.parked.write();
            if remaining.is_empty() {
                parked.remove(symbol);
            } else {
                parked.insert(symbol.to_string(), remaining);
            }
        }

        self.evaluate_exits(symbol, book);
    }

    /// SL/TP exits against the marked book.
    fn evaluate_exits(&self, symbol: &str, book: &TopOfBook) {
        let watches: Vec<ExitParams> = self
            .exits
            .read()
            .values()
            .filter(|w| w.symbol == symbol)
            .cloned()
            .collect();

        for watch in watches {
            let Some((exit_price, _)) =
                self.client_price(symbol, watch.side.opposite(), book)
            else {
                continue;
            };

            let sl_hit = watch.stop_loss.is_some_and(|sl| match watch.side {
                Side::Buy => exit_price <= sl,
                Side::Sell => exit_price >= sl,
            });
            let tp_hit = watch.take_profit.is_some_and(|tp| match watch.side {
                Side::Buy => exit_price >= tp,
                Side::Sell => exit_price <= tp,
            });
            if !sl_hit && !tp_hit {
                continue;
            }

            let Some(position) = self.ledger.find_position(&watch.position_id) else {
                self.exits.write().remove(&watch.position_id);
                continue;
            };
            if position.volume <= EPS {
                self.exits.write().remove(&watch.position_id);
                continue;
            }

            match self.ledger.apply_close_fill(
                &watch.account_id,
                &watch.position_id,
                position.volume,
                exit_price,
            ) {
                Ok(outcome) => {
                    self.risk
                        .on_realized(&watch.account_id, outcome.realized_pnl);
                    self.exits.write().remove(&watch.position_id);
                    info!(
                        position_id = %watch.position_id,
                        reason = if sl_hit { "StopLoss" } else { "TakeProfit" },
                        exit_price,
                        realized = outcome.realized_pnl,
                        "position exit executed"
                    );
                }
                Err(e) => {
                    warn!(
                        position_id = %watch.position_id,
                        error = %e,
                        "exit close failed"
                    );
                }
            }
        }
    }

    /// Dispatcher: subscribe to aggregated-quote events and run one
    /// serialized evaluation task per symbol.
    pub async fn run_dispatcher(self: Arc<Self>) {
        let mut rx = self.events.subscribe();
        let mut feeds: HashMap<String, mpsc::Sender<TopOfBook>> = HashMap::new();

        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "trigger dispatcher lagged on quote stream");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            };
            let EngineEvent::AggregatedQuote { symbol, book } = event else {
                continue;
            };

            let tx = feeds.entry(symbol.clone()).or_insert_with(|| {
                let (tx, mut feed_rx) = mpsc::channel::<TopOfBook>(64);
                let engine = self.clone();
                let sym = symbol.clone();
                tokio::spawn(async move {
                    while let Some(book) = feed_rx.recv().await {
                        engine.on_book_update(&sym, &book);
                    }
                });
                tx
            });
            // Drop the tick if the symbol task is saturated; a fresher book
            // follows immediately.
            let _ = tx.try_send(book);
        }
    }

    fn publish_order(&self, order: &Order) {
        self.events.publish(EngineEvent::OrderUpdate {
            account_id: order.account_id.clone(),
            order: order.clone(),
        });
    }
}

impl std::fmt::Debug for BBookEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BBookEngine")
            .field("parked_symbols", &self.parked.read().len())
            .field("exit_watches", &self.exits.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

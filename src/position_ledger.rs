// =============================================================================
// Position Ledger — authoritative record of open positions and realized PnL
// =============================================================================
//
// Single authority over positions. Only the execution engines call the
// mutating operations, and only on confirmed fills:
//
//   apply_open_fill   — create a position, or merge into the existing
//                       same-side one in netting mode (VWAP open price)
//   apply_close_fill  — reduce volume with proportional realized PnL;
//                       at zero volume the position is frozen and archived
//   mark              — mark-to-market every open position in a symbol
//
// Mutations are serialized per account behind one mutex per account book; a
// position can never be touched by two fills concurrently. Position ids are
// UUIDs and never reused after close.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::TradeError;
use crate::events::{EngineEvent, EventBus};
use crate::runtime_config::NettingMode;
use crate::types::{new_id, now_rfc3339, Side};

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "Open"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// A tracked position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Unique identifier (UUID v4); never reused after close.
    pub id: String,
    pub account_id: String,
    pub symbol: String,
    pub side: Side,
    /// Remaining open volume in lots (reduced by partial closes).
    pub volume: f64,
    /// Volume-weighted average price across opening fills.
    pub open_price: f64,
    #[serde(default)]
    pub current_price: f64,
    /// Units of base per 1.0 lot, captured from symbol config at open.
    pub contract_size: f64,
    pub status: PositionStatus,
    pub opened_at: String,
    #[serde(default)]
    pub closed_at: Option<String>,
    #[serde(default)]
    pub realized_pnl: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    #[serde(default)]
    pub swap: f64,
    #[serde(default)]
    pub commission: f64,
    /// Orders whose fills opened or grew this position.
    pub linked_order_ids: Vec<String>,
}

impl Position {
    /// Notional value of the remaining volume at the current (or open) price.
    pub fn notional(&self) -> f64 {
        let price = if self.current_price > 0.0 {
            self.current_price
        } else {
            self.open_price
        };
        self.volume * self.contract_size * price
    }
}

/// Result of applying a closing fill.
#[derive(Debug, Clone)]
pub struct CloseOutcome {
    pub position: Position,
    /// PnL realized by this fill alone.
    pub realized_pnl: f64,
    pub fully_closed: bool,
}

/// Margin numbers for one account, computed under the account lock.
#[derive(Debug, Clone, Serialize)]
pub struct MarginSnapshot {
    pub balance: f64,
    pub equity: f64,
    pub used_margin: f64,
    pub free_margin: f64,
    /// Total notional across open positions.
    pub exposure: f64,
}

// ---------------------------------------------------------------------------
// Per-account book
// ---------------------------------------------------------------------------

/// All positions and the balance of one account. Accessed only while holding
/// the account mutex.
pub struct AccountBook {
    pub account_id: String,
    pub balance: f64,
    open: Vec<Position>,
    closed: Vec<Position>,
}

impl AccountBook {
    fn new(account_id: String, balance: f64) -> Self {
        Self {
            account_id,
            balance,
            open: Vec::new(),
            closed: Vec::new(),
        }
    }

    pub fn open_positions(&self) -> &[Position] {
        &self.open
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn open_count_for(&self, symbol: &str) -> usize {
        self.open.iter().filter(|p| p.symbol == symbol).count()
    }

    pub fn equity(&self) -> f64 {
        self.balance + self.open.iter().map(|p| p.unrealized_pnl).sum::<f64>()
    }

    pub fn exposure(&self) -> f64 {
        self.open.iter().map(|p| p.notional()).sum()
    }

    pub fn exposure_for(&self, symbol: &str) -> f64 {
        self.open
            .iter()
            .filter(|p| p.symbol == symbol)
            .map(|p| p.notional())
            .sum()
    }

    /// Margin numbers with a per-symbol margin-rate resolver.
    pub fn margin_snapshot(&self, margin_rate_of: impl Fn(&str) -> f64) -> MarginSnapshot {
        let used_margin: f64 = self
            .open
            .iter()
            .map(|p| p.notional() * margin_rate_of(&p.symbol))
            .sum();
        let equity = self.equity();
        MarginSnapshot {
            balance: self.balance,
            equity,
            used_margin,
            free_margin: equity - used_margin,
            exposure: self.exposure(),
        }
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// The process-wide position ledger.
pub struct PositionLedger {
    accounts: RwLock<HashMap<String, Arc<Mutex<AccountBook>>>>,
    netting_mode: NettingMode,
    events: EventBus,
}

impl PositionLedger {
    pub fn new(netting_mode: NettingMode, events: EventBus) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            netting_mode,
            events,
        }
    }

    /// Create the account book if absent. Idempotent; an existing balance is
    /// never overwritten.
    pub fn register_account(&self, account_id: &str, starting_balance: f64) {
        self.accounts
            .write()
            .entry(account_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(AccountBook::new(
                    account_id.to_string(),
                    starting_balance,
                )))
            });
    }

    fn book(&self, account_id: &str) -> Arc<Mutex<AccountBook>> {
        if let Some(book) = self.accounts.read().get(account_id) {
            return book.clone();
        }
        self.accounts
            .write()
            .entry(account_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(AccountBook::new(account_id.to_string(), 0.0)))
            })
            .clone()
    }

    /// Run `f` while exclusively holding the account's book. The pre-trade
    /// risk gate uses this so its exposure / margin checks and the engine's
    /// fills cannot interleave on one account.
    pub fn with_account<R>(&self, account_id: &str, f: impl FnOnce(&mut AccountBook) -> R) -> R {
        let book = self.book(account_id);
        let mut guard = book.lock();
        f(&mut guard)
    }

    // -------------------------------------------------------------------------
    // Fills
    // -------------------------------------------------------------------------

    /// Apply an opening fill: new position, or VWAP merge into the existing
    /// same-side position in netting mode.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_open_fill(
        &self,
        account_id: &str,
        symbol: &str,
        side: Side,
        volume: f64,
        price: f64,
        contract_size: f64,
        linked_order_id: &str,
    ) -> Position {
        let book = self.book(account_id);
        let mut book = book.lock();

        let position = if self.netting_mode == NettingMode::Netting {
            if let Some(existing) = book
                .open
                .iter_mut()
                .find(|p| p.symbol == symbol && p.side == side)
            {
                let total = existing.volume + volume;
                existing.open_price =
                    (existing.open_price * existing.volume + price * volume) / total;
                existing.volume = total;
                if !existing.linked_order_ids.iter().any(|id| id == linked_order_id) {
                    existing.linked_order_ids.push(linked_order_id.to_string());
                }
                debug!(
                    position_id = %existing.id,
                    symbol,
                    volume = existing.volume,
                    vwap = existing.open_price,
                    "netted opening fill into existing position"
                );
                existing.clone()
            } else {
                let p = self.new_position(
                    account_id, symbol, side, volume, price, contract_size, linked_order_id,
                );
                book.open.push(p.clone());
                p
            }
        } else {
            let p = self.new_position(
                account_id, symbol, side, volume, price, contract_size, linked_order_id,
            );
            book.open.push(p.clone());
            p
        };

        drop(book);
        self.events.publish(EngineEvent::PositionUpdate {
            account_id: account_id.to_string(),
            position: position.clone(),
        });
        position
    }

    fn new_position(
        &self,
        account_id: &str,
        symbol: &str,
        side: Side,
        volume: f64,
        price: f64,
        contract_size: f64,
        linked_order_id: &str,
    ) -> Position {
        let position = Position {
            id: new_id(),
            account_id: account_id.to_string(),
            symbol: symbol.to_string(),
            side,
            volume,
            open_price: price,
            current_price: price,
            contract_size,
            status: PositionStatus::Open,
            opened_at: now_rfc3339(),
            closed_at: None,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            swap: 0.0,
            commission: 0.0,
            linked_order_ids: vec![linked_order_id.to_string()],
        };
        info!(
            position_id = %position.id,
            account = %account_id,
            symbol,
            side = %side,
            volume,
            price,
            "position opened"
        );
        position
    }

    /// Apply a closing fill. `volume` beyond the remaining position volume is
    /// an error; a close that brings the volume to zero freezes the position.
    pub fn apply_close_fill(
        &self,
        account_id: &str,
        position_id: &str,
        volume: f64,
        price: f64,
    ) -> Result<CloseOutcome, TradeError> {
        const EPS: f64 = 1e-9;

        let book = self.book(account_id);
        let mut book = book.lock();

        let idx = book
            .open
            .iter()
            .position(|p| p.id == position_id)
            .ok_or_else(|| TradeError::PositionNotFound(position_id.to_string()))?;

        if volume <= 0.0 || volume > book.open[idx].volume + EPS {
            return Err(TradeError::Validation(format!(
                "close volume {volume} outside (0, {}]",
                book.open[idx].volume
            )));
        }

        let closed_volume = volume.min(book.open[idx].volume);
        let pos = &mut book.open[idx];
        let realized = pos.side.direction()
            * (price - pos.open_price)
            * closed_volume
            * pos.contract_size;

        pos.volume -= closed_volume;
        pos.realized_pnl += realized;
        pos.current_price = price;

        let fully_closed = pos.volume <= EPS;
        let position = if fully_closed {
            pos.volume = 0.0;
            pos.unrealized_pnl = 0.0;
            pos.status = PositionStatus::Closed;
            pos.closed_at = Some(now_rfc3339());
            let frozen = book.open.remove(idx);
            book.closed.push(frozen.clone());
            frozen
        } else {
            pos.unrealized_pnl =
                pos.side.direction() * (price - pos.open_price) * pos.volume * pos.contract_size;
            pos.clone()
        };

        book.balance += realized;

        info!(
            position_id = %position.id,
            account = %account_id,
            closed_volume,
            price,
            realized,
            fully_closed,
            "closing fill applied"
        );

        drop(book);
        self.events.publish(EngineEvent::PositionUpdate {
            account_id: account_id.to_string(),
            position: position.clone(),
        });

        Ok(CloseOutcome {
            position,
            realized_pnl: realized,
            fully_closed,
        })
    }

    /// Mark-to-market every open position in a symbol. Longs mark against the
    /// bid (their exit price), shorts against the ask.
    pub fn mark(&self, symbol: &str, bid: f64, ask: f64) {
        let books: Vec<Arc<Mutex<AccountBook>>> =
            self.accounts.read().values().cloned().collect();
        for book in books {
            let mut book = book.lock();
            for pos in book.open.iter_mut().filter(|p| p.symbol == symbol) {
                let price = match pos.side {
                    Side::Buy => bid,
                    Side::Sell => ask,
                };
                if price <= 0.0 {
                    continue;
                }
                pos.current_price = price;
                pos.unrealized_pnl = pos.side.direction()
                    * (price - pos.open_price)
                    * pos.volume
                    * pos.contract_size;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn open_positions(&self, account_id: &str) -> Vec<Position> {
        self.with_account(account_id, |book| book.open_positions().to_vec())
    }

    pub fn closed_positions(&self, account_id: &str, count: usize) -> Vec<Position> {
        self.with_account(account_id, |book| {
            book.closed.iter().rev().take(count).cloned().collect()
        })
    }

    /// Find a position (open or closed) by id across all accounts.
    pub fn find_position(&self, position_id: &str) -> Option<Position> {
        let books: Vec<Arc<Mutex<AccountBook>>> =
            self.accounts.read().values().cloned().collect();
        for book in books {
            let book = book.lock();
            if let Some(p) = book
                .open
                .iter()
                .chain(book.closed.iter())
                .find(|p| p.id == position_id)
            {
                return Some(p.clone());
            }
        }
        None
    }

    pub fn account_ids(&self) -> Vec<String> {
        self.accounts.read().keys().cloned().collect()
    }
}

impl std::fmt::Debug for PositionLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionLedger")
            .field("accounts", &self.accounts.read().len())
            .field("netting_mode", &self.netting_mode)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(mode: NettingMode) -> PositionLedger {
        PositionLedger::new(mode, EventBus::new())
    }

    #[test]
    fn open_fill_creates_position() {
        let l = ledger(NettingMode::Netting);
        l.register_account("acc", 10_000.0);
        let p = l.apply_open_fill("acc", "EURUSD", Side::Buy, 1.0, 1.10020, 100_000.0, "o1");
        assert_eq!(p.volume, 1.0);
        assert_eq!(p.open_price, 1.10020);
        assert_eq!(p.status, PositionStatus::Open);
        assert_eq!(p.linked_order_ids, vec!["o1".to_string()]);
        assert_eq!(l.open_positions("acc").len(), 1);
    }

    #[test]
    fn netting_merges_same_side_with_vwap() {
        let l = ledger(NettingMode::Netting);
        l.register_account("acc", 10_000.0);
        l.apply_open_fill("acc", "EURUSD", Side::Buy, 1.0, 1.1000, 100_000.0, "o1");
        let merged = l.apply_open_fill("acc", "EURUSD", Side::Buy, 1.0, 1.1002, 100_000.0, "o2");

        assert_eq!(l.open_positions("acc").len(), 1);
        assert_eq!(merged.volume, 2.0);
        assert!((merged.open_price - 1.1001).abs() < 1e-9);
        assert_eq!(merged.linked_order_ids.len(), 2);
    }

    #[test]
    fn hedging_keeps_positions_separate() {
        let l = ledger(NettingMode::Hedging);
        l.register_account("acc", 10_000.0);
        l.apply_open_fill("acc", "EURUSD", Side::Buy, 1.0, 1.1000, 100_000.0, "o1");
        l.apply_open_fill("acc", "EURUSD", Side::Buy, 1.0, 1.1002, 100_000.0, "o2");
        assert_eq!(l.open_positions("acc").len(), 2);
    }

    #[test]
    fn opposite_sides_never_merge() {
        let l = ledger(NettingMode::Netting);
        l.register_account("acc", 10_000.0);
        l.apply_open_fill("acc", "EURUSD", Side::Buy, 1.0, 1.1000, 100_000.0, "o1");
        l.apply_open_fill("acc", "EURUSD", Side::Sell, 1.0, 1.1002, 100_000.0, "o2");
        assert_eq!(l.open_positions("acc").len(), 2);
    }

    #[test]
    fn full_close_freezes_position_and_credits_balance() {
        let l = ledger(NettingMode::Netting);
        l.register_account("acc", 10_000.0);
        let p = l.apply_open_fill("acc", "EURUSD", Side::Buy, 1.0, 1.1000, 100_000.0, "o1");

        let outcome = l.apply_close_fill("acc", &p.id, 1.0, 1.1010).unwrap();
        assert!(outcome.fully_closed);
        // 0.0010 × 1.0 lot × 100k = 100.
        assert!((outcome.realized_pnl - 100.0).abs() < 1e-6);
        assert_eq!(outcome.position.status, PositionStatus::Closed);
        assert!(outcome.position.closed_at.is_some());
        assert!(l.open_positions("acc").is_empty());

        let balance = l.with_account("acc", |b| b.balance);
        assert!((balance - 10_100.0).abs() < 1e-6);
    }

    #[test]
    fn partial_close_realizes_proportionally() {
        let l = ledger(NettingMode::Netting);
        l.register_account("acc", 10_000.0);
        let p = l.apply_open_fill("acc", "EURUSD", Side::Buy, 2.0, 1.1000, 100_000.0, "o1");

        let outcome = l.apply_close_fill("acc", &p.id, 0.5, 1.1010).unwrap();
        assert!(!outcome.fully_closed);
        assert!((outcome.realized_pnl - 50.0).abs() < 1e-6);
        assert_eq!(outcome.position.volume, 1.5);
        assert_eq!(outcome.position.status, PositionStatus::Open);

        // Closing the rest freezes the total realized PnL.
        let rest = l.apply_close_fill("acc", &p.id, 1.5, 1.1010).unwrap();
        assert!(rest.fully_closed);
        assert!((rest.position.realized_pnl - 200.0).abs() < 1e-6);
    }

    #[test]
    fn short_close_pnl_sign() {
        let l = ledger(NettingMode::Netting);
        l.register_account("acc", 10_000.0);
        let p = l.apply_open_fill("acc", "EURUSD", Side::Sell, 1.0, 1.1000, 100_000.0, "o1");

        // Price rose: a short loses.
        let outcome = l.apply_close_fill("acc", &p.id, 1.0, 1.1010).unwrap();
        assert!((outcome.realized_pnl + 100.0).abs() < 1e-6);
    }

    #[test]
    fn close_volume_above_open_is_rejected() {
        let l = ledger(NettingMode::Netting);
        l.register_account("acc", 10_000.0);
        let p = l.apply_open_fill("acc", "EURUSD", Side::Buy, 1.0, 1.1000, 100_000.0, "o1");
        assert!(matches!(
            l.apply_close_fill("acc", &p.id, 2.0, 1.1010),
            Err(TradeError::Validation(_))
        ));
    }

    #[test]
    fn close_unknown_position_is_not_found() {
        let l = ledger(NettingMode::Netting);
        l.register_account("acc", 10_000.0);
        assert!(matches!(
            l.apply_close_fill("acc", "nope", 1.0, 1.1),
            Err(TradeError::PositionNotFound(_))
        ));
    }

    #[test]
    fn mark_updates_unrealized_against_exit_side() {
        let l = ledger(NettingMode::Netting);
        l.register_account("acc", 10_000.0);
        l.apply_open_fill("acc", "EURUSD", Side::Buy, 1.0, 1.1000, 100_000.0, "o1");
        l.apply_open_fill("acc", "EURUSD", Side::Sell, 1.0, 1.1000, 100_000.0, "o2");

        l.mark("EURUSD", 1.1010, 1.1012);

        let positions = l.open_positions("acc");
        let long = positions.iter().find(|p| p.side == Side::Buy).unwrap();
        let short = positions.iter().find(|p| p.side == Side::Sell).unwrap();
        // Long exits at bid 1.1010: +100. Short exits at ask 1.1012: −120.
        assert!((long.unrealized_pnl - 100.0).abs() < 1e-6);
        assert!((short.unrealized_pnl + 120.0).abs() < 1e-6);

        let equity = l.with_account("acc", |b| b.equity());
        assert!((equity - (10_000.0 - 20.0)).abs() < 1e-6);
    }

    #[test]
    fn volume_conservation_across_fills() {
        // Signed open volumes equal signed opening minus closing fills.
        let l = ledger(NettingMode::Netting);
        l.register_account("acc", 10_000.0);
        let p = l.apply_open_fill("acc", "EURUSD", Side::Buy, 2.0, 1.1, 100_000.0, "o1");
        l.apply_open_fill("acc", "EURUSD", Side::Buy, 1.0, 1.2, 100_000.0, "o2");
        l.apply_close_fill("acc", &p.id, 1.5, 1.15).unwrap();

        let net: f64 = l
            .open_positions("acc")
            .iter()
            .map(|p| p.side.direction() * p.volume)
            .sum();
        assert!((net - (2.0 + 1.0 - 1.5)).abs() < 1e-9);
    }

    #[test]
    fn margin_snapshot_uses_resolver() {
        let l = ledger(NettingMode::Netting);
        l.register_account("acc", 10_000.0);
        l.apply_open_fill("acc", "EURUSD", Side::Buy, 1.0, 1.0, 100_000.0, "o1");

        let snap = l.with_account("acc", |b| b.margin_snapshot(|_| 0.01));
        assert!((snap.used_margin - 1_000.0).abs() < 1e-6);
        assert!((snap.exposure - 100_000.0).abs() < 1e-6);
        assert!((snap.free_margin - 9_000.0).abs() < 1e-6);
    }
}

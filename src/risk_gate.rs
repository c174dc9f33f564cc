// =============================================================================
// Pre-Trade Risk Gate — deterministic, ordered, fail-closed
// =============================================================================
//
// Eleven checks, first failure short-circuits:
//   1. kill switch            6. position counts
//   2. trading hours          7. exposure (per symbol + total)
//   3. symbol allow/deny      8. post-trade margin
//   4. order size bounds      9. daily trade count / daily loss
//   5. fat finger            10. volatility circuit breaker
//                            11. leverage cap
//
// The whole chain runs while holding the per-account risk state lock, and
// checks 6-8 additionally run inside the position ledger's account mutex —
// concurrent orders on one account cannot collectively breach exposure or
// margin limits. Accepted orders reserve their notional until they reach a
// terminal state.
//
// Breaching the daily-loss limit auto-activates the account kill switch.
// Daily counters reset when the UTC date rolls over.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::errors::TradeError;
use crate::position_ledger::PositionLedger;
use crate::quotes::aggregator::QuoteAggregator;
use crate::runtime_config::RuntimeConfig;
use crate::types::{now_ms, OrderRequest, OrderType};

// ---------------------------------------------------------------------------
// Per-account and per-symbol mutable state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct AccountRiskState {
    kill_switch: bool,
    daily_trades: u32,
    /// Positive number of currency units lost today (realized).
    daily_realized_loss: f64,
    /// Rolling history of accepted volumes for the fat-finger baseline.
    recent_volumes: VecDeque<f64>,
    /// Notional reserved by accepted-but-not-terminal orders.
    pending_notional: f64,
    current_date: String,
}

impl AccountRiskState {
    fn new() -> Self {
        Self {
            kill_switch: false,
            daily_trades: 0,
            daily_realized_loss: 0.0,
            recent_volumes: VecDeque::new(),
            pending_notional: 0.0,
            current_date: utc_date(),
        }
    }

    fn roll_date_if_needed(&mut self) {
        let today = utc_date();
        if self.current_date != today {
            info!(
                old_date = %self.current_date,
                new_date = %today,
                "date rolled — resetting daily risk counters"
            );
            self.daily_trades = 0;
            self.daily_realized_loss = 0.0;
            self.current_date = today;
        }
    }
}

fn utc_date() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

#[derive(Debug, Default)]
struct BreakerState {
    /// (ts_ms, mid) observations inside the configured window.
    window: VecDeque<(i64, f64)>,
    tripped_until_ms: Option<i64>,
}

/// Dashboard snapshot of one account's risk state.
#[derive(Debug, Clone, Serialize)]
pub struct AccountRiskSnapshot {
    pub account_id: String,
    pub kill_switch: bool,
    pub daily_trades: u32,
    pub daily_realized_loss: f64,
    pub pending_notional: f64,
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

/// The pre-trade risk gate. One instance per engine.
pub struct RiskGate {
    config: Arc<RwLock<RuntimeConfig>>,
    ledger: Arc<PositionLedger>,
    aggregator: Arc<QuoteAggregator>,
    accounts: RwLock<HashMap<String, Arc<Mutex<AccountRiskState>>>>,
    breakers: RwLock<HashMap<String, BreakerState>>,
    global_kill: AtomicBool,
}

impl RiskGate {
    pub fn new(
        config: Arc<RwLock<RuntimeConfig>>,
        ledger: Arc<PositionLedger>,
        aggregator: Arc<QuoteAggregator>,
    ) -> Self {
        Self {
            config,
            ledger,
            aggregator,
            accounts: RwLock::new(HashMap::new()),
            breakers: RwLock::new(HashMap::new()),
            global_kill: AtomicBool::new(false),
        }
    }

    fn account_state(&self, account_id: &str) -> Arc<Mutex<AccountRiskState>> {
        if let Some(state) = self.accounts.read().get(account_id) {
            return state.clone();
        }
        self.accounts
            .write()
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(AccountRiskState::new())))
            .clone()
    }

    // -------------------------------------------------------------------------
    // The check chain
    // -------------------------------------------------------------------------

    /// Run the full chain; on success the order's notional is reserved and
    /// the daily trade counter incremented. The caller must release the
    /// reservation via [`RiskGate::release`] when the order reaches a
    /// terminal state.
    pub fn check_and_reserve(&self, req: &OrderRequest) -> Result<f64, TradeError> {
        let config = self.config.read().clone();
        let account_cfg = config.account(&req.account_id);
        let symbol_cfg = config.symbol(&req.symbol);
        let limits = &account_cfg.limits;

        let state = self.account_state(&req.account_id);
        let mut state = state.lock();
        state.roll_date_if_needed();

        // 1. Kill switch (global, sticky per-account, or configured).
        if self.global_kill.load(Ordering::SeqCst) {
            return Err(TradeError::KillSwitchActive("system-wide".into()));
        }
        if state.kill_switch || limits.kill_switch_enabled {
            return Err(TradeError::KillSwitchActive(format!(
                "account {}",
                req.account_id
            )));
        }

        // 2. Trading hours.
        if !symbol_cfg.trading_hours.is_open(Utc::now()) {
            return Err(TradeError::MarketClosed(req.symbol.clone()));
        }

        // 3. Symbol allow / deny.
        if limits.denied_symbols.iter().any(|s| s == &req.symbol) {
            return Err(TradeError::SymbolNotPermitted(format!(
                "{} is denied for {}",
                req.symbol, req.account_id
            )));
        }
        if let Some(allowed) = &limits.allowed_symbols {
            if !allowed.iter().any(|s| s == &req.symbol) {
                return Err(TradeError::SymbolNotPermitted(format!(
                    "{} is not in the allow list for {}",
                    req.symbol, req.account_id
                )));
            }
        }

        // 4. Order size bounds and lot step.
        if req.volume < symbol_cfg.min_lot || req.volume > symbol_cfg.max_lot {
            return Err(TradeError::InvalidVolume(format!(
                "{} outside [{}, {}]",
                req.volume, symbol_cfg.min_lot, symbol_cfg.max_lot
            )));
        }
        let steps = req.volume / symbol_cfg.lot_step;
        if (steps - steps.round()).abs() > 1e-6 {
            return Err(TradeError::InvalidVolume(format!(
                "{} is not a multiple of lot step {}",
                req.volume, symbol_cfg.lot_step
            )));
        }

        // 5. Fat finger: beyond multiplier × max(1 lot, rolling average).
        let multiplier = config.engine.fat_finger_multiplier;
        let baseline = if state.recent_volumes.is_empty() {
            1.0
        } else {
            state.recent_volumes.iter().sum::<f64>() / state.recent_volumes.len() as f64
        };
        let fat_threshold = multiplier * baseline.max(1.0);
        if req.volume > fat_threshold {
            return Err(TradeError::FatFingerSuspected(format!(
                "{} exceeds {:.2} ({}× rolling average)",
                req.volume, fat_threshold, multiplier
            )));
        }

        // Reference price for notional-based checks. Fail closed when no
        // price is known at all.
        let reference_price = req
            .price
            .or_else(|| self.aggregator.top_of_book(&req.symbol).mid())
            .ok_or_else(|| TradeError::NoPrice(req.symbol.clone()))?;
        let order_notional = req.volume * symbol_cfg.contract_size * reference_price;

        // 6-8 run under the ledger's account mutex so the snapshot cannot
        // drift while we decide.
        let pending = state.pending_notional;
        let snapshot = self.ledger.with_account(&req.account_id, |book| {
            // 6. Position counts. A pure close adds no position.
            if req.closing_position_id.is_none() {
                if book.open_count_for(&req.symbol) as u32 >= limits.max_positions_per_symbol {
                    return Err(TradeError::PositionLimitExceeded(format!(
                        "{} open positions in {}",
                        book.open_count_for(&req.symbol),
                        req.symbol
                    )));
                }
                if book.open_count() as u32 >= limits.max_total_positions {
                    return Err(TradeError::PositionLimitExceeded(format!(
                        "{} open positions total",
                        book.open_count()
                    )));
                }
            }

            // 7. Exposure, including reservations by in-flight orders.
            let symbol_exposure = book.exposure_for(&req.symbol) + order_notional;
            if symbol_exposure > symbol_cfg.max_exposure {
                return Err(TradeError::ExposureLimitExceeded(format!(
                    "{symbol_exposure:.0} notional in {} (limit {:.0})",
                    req.symbol, symbol_cfg.max_exposure
                )));
            }
            let total_exposure = book.exposure() + pending + order_notional;
            if total_exposure > limits.max_total_exposure {
                return Err(TradeError::ExposureLimitExceeded(format!(
                    "{total_exposure:.0} total notional (limit {:.0})",
                    limits.max_total_exposure
                )));
            }

            // 8. Post-trade margin.
            let margin = book.margin_snapshot(|symbol| config.symbol(symbol).margin_rate);
            let new_margin = order_notional * symbol_cfg.margin_rate;
            if margin.free_margin < new_margin {
                return Err(TradeError::InsufficientMargin(format!(
                    "free margin {:.2} below required {:.2}",
                    margin.free_margin, new_margin
                )));
            }
            if margin.equity <= 0.0 {
                return Err(TradeError::InsufficientMargin(
                    "equity is not positive".into(),
                ));
            }

            // Snapshot for the leverage check (11), taken under the same lock.
            Ok((margin.equity, total_exposure))
        });
        let (equity, total_exposure) = snapshot?;

        // 9. Daily trade count and daily realized loss.
        if state.daily_trades >= limits.max_daily_trades {
            return Err(TradeError::DailyLimitExceeded(format!(
                "{} trades today (limit {})",
                state.daily_trades, limits.max_daily_trades
            )));
        }
        if state.daily_realized_loss >= limits.max_daily_loss {
            state.kill_switch = true;
            warn!(account = %req.account_id, "daily loss limit hit — kill switch activated");
            return Err(TradeError::DailyLimitExceeded(format!(
                "daily loss {:.2} at limit {:.2}",
                state.daily_realized_loss, limits.max_daily_loss
            )));
        }

        // 10. Volatility circuit breaker.
        if let Some(until) = self.breaker_tripped_until(&req.symbol) {
            let now = now_ms();
            if now < until {
                return Err(TradeError::CircuitBreakerTripped(format!(
                    "{} blocked for {}s more",
                    req.symbol,
                    (until - now) / 1_000
                )));
            }
        }

        // 11. Leverage cap on the snapshot taken at step 8.
        let leverage = total_exposure / equity;
        if leverage > limits.max_leverage {
            return Err(TradeError::LeverageExceeded(format!(
                "{leverage:.1}x exceeds {:.1}x",
                limits.max_leverage
            )));
        }

        // Accepted: reserve and count.
        state.pending_notional += order_notional;
        state.daily_trades += 1;
        state.recent_volumes.push_back(req.volume);
        while state.recent_volumes.len() > config.engine.fat_finger_history {
            state.recent_volumes.pop_front();
        }

        debug!(
            account = %req.account_id,
            symbol = %req.symbol,
            volume = req.volume,
            notional = order_notional,
            "risk checks passed"
        );
        Ok(order_notional)
    }

    /// Release an accepted order's reservation once it is terminal.
    pub fn release(&self, account_id: &str, notional: f64) {
        let state = self.account_state(account_id);
        let mut state = state.lock();
        state.pending_notional = (state.pending_notional - notional).max(0.0);
    }

    // -------------------------------------------------------------------------
    // Realized-loss feedback and kill switches
    // -------------------------------------------------------------------------

    /// Record realized PnL from a closing fill. Breaching the daily-loss
    /// limit activates the account kill switch immediately.
    pub fn on_realized(&self, account_id: &str, pnl: f64) {
        if pnl >= 0.0 {
            return;
        }
        let max_daily_loss = self.config.read().account(account_id).limits.max_daily_loss;
        let state = self.account_state(account_id);
        let mut state = state.lock();
        state.roll_date_if_needed();
        state.daily_realized_loss += -pnl;
        if state.daily_realized_loss >= max_daily_loss && !state.kill_switch {
            state.kill_switch = true;
            warn!(
                account = %account_id,
                daily_loss = state.daily_realized_loss,
                limit = max_daily_loss,
                "daily loss limit breached — kill switch activated"
            );
        }
    }

    pub fn set_account_kill(&self, account_id: &str, active: bool) {
        let state = self.account_state(account_id);
        state.lock().kill_switch = active;
        warn!(account = %account_id, active, "account kill switch set");
    }

    pub fn set_global_kill(&self, active: bool) {
        self.global_kill.store(active, Ordering::SeqCst);
        warn!(active, "global kill switch set");
    }

    pub fn global_kill(&self) -> bool {
        self.global_kill.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Volatility circuit breaker
    // -------------------------------------------------------------------------

    /// Feed a mid price observation. Called from the aggregated-quote stream.
    pub fn observe_price(&self, symbol: &str, mid: f64) {
        let Some(breaker_cfg) = self.config.read().symbol(symbol).circuit_breaker else {
            return;
        };
        let now = now_ms();
        let mut breakers = self.breakers.write();
        let state = breakers.entry(symbol.to_string()).or_default();

        state.window.push_back((now, mid));
        let horizon = now - breaker_cfg.window_secs * 1_000;
        while state
            .window
            .front()
            .is_some_and(|(ts, _)| *ts < horizon)
        {
            state.window.pop_front();
        }

        if state.tripped_until_ms.is_some_and(|until| now < until) {
            return;
        }

        let (min, max) = state.window.iter().fold(
            (f64::INFINITY, f64::NEG_INFINITY),
            |(lo, hi), (_, p)| (lo.min(*p), hi.max(*p)),
        );
        if min.is_finite() && min > 0.0 {
            let change_pct = (max - min) / min * 100.0;
            if change_pct >= breaker_cfg.price_change_pct {
                state.tripped_until_ms = Some(now + breaker_cfg.cooldown_secs * 1_000);
                state.window.clear();
                warn!(
                    symbol,
                    change_pct,
                    cooldown_secs = breaker_cfg.cooldown_secs,
                    "volatility circuit breaker tripped"
                );
            }
        }
    }

    fn breaker_tripped_until(&self, symbol: &str) -> Option<i64> {
        self.breakers
            .read()
            .get(symbol)
            .and_then(|b| b.tripped_until_ms)
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    pub fn snapshot(&self) -> Vec<AccountRiskSnapshot> {
        let entries: Vec<(String, Arc<Mutex<AccountRiskState>>)> = self
            .accounts
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut out: Vec<AccountRiskSnapshot> = entries
            .into_iter()
            .map(|(account_id, state)| {
                let state = state.lock();
                AccountRiskSnapshot {
                    account_id,
                    kill_switch: state.kill_switch,
                    daily_trades: state.daily_trades,
                    daily_realized_loss: state.daily_realized_loss,
                    pending_notional: state.pending_notional,
                }
            })
            .collect();
        out.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        out
    }
}

impl std::fmt::Debug for RiskGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskGate")
            .field("accounts", &self.accounts.read().len())
            .field("global_kill", &self.global_kill())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::quotes::aggregator::Quote;
    use crate::runtime_config::{
        AccountConfig, AccountRiskLimits, CircuitBreakerConfig, NettingMode, SymbolConfig,
    };
    use crate::types::Side;

    struct Fixture {
        gate: RiskGate,
        ledger: Arc<PositionLedger>,
        aggregator: Arc<QuoteAggregator>,
    }

    fn fixture(mut config: RuntimeConfig) -> Fixture {
        config.accounts.push(AccountConfig {
            account_id: "acc".into(),
            group: "default".into(),
            starting_balance: 10_000.0,
            limits: AccountRiskLimits {
                max_daily_loss: 500.0,
                max_daily_trades: 5,
                max_positions_per_symbol: 2,
                max_total_positions: 3,
                max_total_exposure: 10_000_000.0,
                max_leverage: 200.0,
                ..Default::default()
            },
        });
        let config = Arc::new(RwLock::new(config));
        let events = EventBus::new();
        let health = Arc::new(crate::lp_health::LpHealthTracker::new(
            &config.read().sor,
            0.01,
        ));
        let aggregator = Arc::new(QuoteAggregator::new(5_000, health, events.clone()));
        let ledger = Arc::new(PositionLedger::new(NettingMode::Netting, events));
        ledger.register_account("acc", 10_000.0);
        let gate = RiskGate::new(config, ledger.clone(), aggregator.clone());
        Fixture {
            gate,
            ledger,
            aggregator,
        }
    }

    fn feed_price(aggregator: &QuoteAggregator, symbol: &str, bid: f64, ask: f64) {
        aggregator.apply_quote(Quote {
            symbol: symbol.into(),
            lp: "X".into(),
            bid,
            ask,
            bid_volume: None,
            ask_volume: None,
            ts_ms: now_ms(),
        });
    }

    fn request(volume: f64) -> OrderRequest {
        OrderRequest {
            account_id: "acc".into(),
            symbol: "EURUSD".into(),
            side: Side::Buy,
            order_type: OrderType::Market,
            volume,
            price: None,
            trigger_price: None,
            time_in_force: Default::default(),
            stop_loss: None,
            take_profit: None,
            closing_position_id: None,
        }
    }

    #[test]
    fn happy_path_reserves_notional() {
        let f = fixture(RuntimeConfig::default());
        feed_price(&f.aggregator, "EURUSD", 1.1000, 1.1002);
        let notional = f.gate.check_and_reserve(&request(1.0)).unwrap();
        assert!((notional - 1.0 * 100_000.0 * 1.1001).abs() < 1.0);

        let snap = &f.gate.snapshot()[0];
        assert_eq!(snap.daily_trades, 1);
        assert!(snap.pending_notional > 0.0);

        f.gate.release("acc", notional);
        assert_eq!(f.gate.snapshot()[0].pending_notional, 0.0);
    }

    #[test]
    fn global_kill_switch_blocks_everything() {
        let f = fixture(RuntimeConfig::default());
        feed_price(&f.aggregator, "EURUSD", 1.1000, 1.1002);
        f.gate.set_global_kill(true);
        assert!(matches!(
            f.gate.check_and_reserve(&request(1.0)),
            Err(TradeError::KillSwitchActive(_))
        ));
    }

    #[test]
    fn daily_loss_breach_trips_kill_switch_for_next_order() {
        let f = fixture(RuntimeConfig::default());
        feed_price(&f.aggregator, "EURUSD", 1.1000, 1.1002);

        // Lose more than the 500 limit.
        f.gate.on_realized("acc", -600.0);
        assert!(matches!(
            f.gate.check_and_reserve(&request(1.0)),
            Err(TradeError::KillSwitchActive(_))
        ));
    }

    #[test]
    fn denied_symbol_is_rejected() {
        let mut config = RuntimeConfig::default();
        config.accounts.push(AccountConfig {
            account_id: "acc2".into(),
            group: "default".into(),
            starting_balance: 10_000.0,
            limits: AccountRiskLimits {
                denied_symbols: vec!["XAUUSD".into()],
                ..Default::default()
            },
        });
        let f = fixture(config);
        feed_price(&f.aggregator, "XAUUSD", 2000.0, 2000.5);
        let mut req = request(0.1);
        req.account_id = "acc2".into();
        req.symbol = "XAUUSD".into();
        assert!(matches!(
            f.gate.check_and_reserve(&req),
            Err(TradeError::SymbolNotPermitted(_))
        ));
    }

    #[test]
    fn lot_step_violation_is_invalid_volume() {
        let f = fixture(RuntimeConfig::default());
        feed_price(&f.aggregator, "EURUSD", 1.1000, 1.1002);
        assert!(matches!(
            f.gate.check_and_reserve(&request(0.015)),
            Err(TradeError::InvalidVolume(_))
        ));
        assert!(matches!(
            f.gate.check_and_reserve(&request(0.001)),
            Err(TradeError::InvalidVolume(_))
        ));
    }

    #[test]
    fn fat_finger_uses_rolling_average() {
        let mut config = RuntimeConfig::default();
        config.accounts.push(AccountConfig {
            account_id: "whale".into(),
            group: "default".into(),
            starting_balance: 10_000_000.0,
            limits: AccountRiskLimits {
                max_total_exposure: 1e9,
                max_leverage: 1_000.0,
                ..Default::default()
            },
        });
        let f = fixture(config);
        f.ledger.register_account("whale", 10_000_000.0);
        feed_price(&f.aggregator, "EURUSD", 1.1000, 1.1002);

        let mut req = request(0.1);
        req.account_id = "whale".into();
        // Build a baseline of 0.1-lot orders.
        for _ in 0..3 {
            let notional = f.gate.check_and_reserve(&req).unwrap();
            f.gate.release("whale", notional);
        }
        // Threshold is multiplier × max(1, avg) = 10 × 1 = 10 lots.
        let mut big = req.clone();
        big.volume = 11.0;
        assert!(matches!(
            f.gate.check_and_reserve(&big),
            Err(TradeError::FatFingerSuspected(_))
        ));
        big.volume = 10.0;
        f.gate.check_and_reserve(&big).unwrap();
    }

    #[test]
    fn position_count_limit() {
        let f = fixture(RuntimeConfig::default());
        feed_price(&f.aggregator, "EURUSD", 1.1000, 1.1002);
        f.ledger
            .register_account("acc", 10_000.0);
        // Two open positions in EURUSD (limit is 2 per symbol).
        f.ledger
            .apply_open_fill("acc", "EURUSD", Side::Buy, 0.1, 1.1, 100_000.0, "o1");
        f.ledger
            .apply_open_fill("acc", "EURUSD", Side::Sell, 0.1, 1.1, 100_000.0, "o2");
        assert!(matches!(
            f.gate.check_and_reserve(&request(0.1)),
            Err(TradeError::PositionLimitExceeded(_))
        ));
    }

    #[test]
    fn close_requests_skip_position_count() {
        let f = fixture(RuntimeConfig::default());
        feed_price(&f.aggregator, "EURUSD", 1.1000, 1.1002);
        f.ledger
            .apply_open_fill("acc", "EURUSD", Side::Buy, 0.1, 1.1, 100_000.0, "o1");
        f.ledger
            .apply_open_fill("acc", "EURUSD", Side::Sell, 0.1, 1.1, 100_000.0, "o2");
        let mut req = request(0.1);
        req.closing_position_id = Some("p1".into());
        req.side = Side::Sell;
        f.gate.check_and_reserve(&req).unwrap();
    }

    #[test]
    fn margin_exhaustion_is_rejected() {
        let f = fixture(RuntimeConfig::default());
        feed_price(&f.aggregator, "EURUSD", 1.1000, 1.1002);
        // 10 lots × 100k × 1.1 × 1% = 11k margin > 10k equity → rejected
        // (fat finger threshold of 10 lots passes first at exactly 10).
        assert!(matches!(
            f.gate.check_and_reserve(&request(10.0)),
            Err(TradeError::InsufficientMargin(_))
        ));
    }

    #[test]
    fn daily_trade_cap() {
        let f = fixture(RuntimeConfig::default());
        feed_price(&f.aggregator, "EURUSD", 1.1000, 1.1002);
        for _ in 0..5 {
            let notional = f.gate.check_and_reserve(&request(0.01)).unwrap();
            f.gate.release("acc", notional);
        }
        assert!(matches!(
            f.gate.check_and_reserve(&request(0.01)),
            Err(TradeError::DailyLimitExceeded(_))
        ));
    }

    #[test]
    fn no_reference_price_fails_closed() {
        let f = fixture(RuntimeConfig::default());
        assert!(matches!(
            f.gate.check_and_reserve(&request(1.0)),
            Err(TradeError::NoPrice(_))
        ));
    }

    #[test]
    fn circuit_breaker_trips_and_cools_down() {
        let mut config = RuntimeConfig::default();
        config.symbols.push(SymbolConfig {
            contract_size: 100.0,
            circuit_breaker: Some(CircuitBreakerConfig {
                price_change_pct: 2.0,
                window_secs: 60,
                cooldown_secs: 300,
            }),
            ..SymbolConfig::fallback("XAUUSD")
        });
        let f = fixture(config);
        feed_price(&f.aggregator, "XAUUSD", 2000.0, 2000.5);

        // 2000 → 2045 in one window: 2.25% ≥ 2%.
        f.gate.observe_price("XAUUSD", 2000.0);
        f.gate.observe_price("XAUUSD", 2045.0);

        let mut req = request(0.1);
        req.symbol = "XAUUSD".into();
        assert!(matches!(
            f.gate.check_and_reserve(&req),
            Err(TradeError::CircuitBreakerTripped(_))
        ));
    }

    #[test]
    fn exposure_includes_pending_reservations() {
        let mut config = RuntimeConfig::default();
        config.accounts.push(AccountConfig {
            account_id: "acc3".into(),
            group: "default".into(),
            starting_balance: 1_000_000.0,
            limits: AccountRiskLimits {
                max_total_exposure: 250_000.0,
                ..Default::default()
            },
        });
        let f = fixture(config);
        f.ledger.register_account("acc3", 1_000_000.0);
        feed_price(&f.aggregator, "EURUSD", 1.0000, 1.0000);
        let mut req = request(1.0);
        req.account_id = "acc3".into();

        // First 1.0-lot order reserves 100k of the 250k budget.
        f.gate.check_and_reserve(&req).unwrap();
        // Second fits (200k), third would breach (300k > 250k).
        f.gate.check_and_reserve(&req).unwrap();
        assert!(matches!(
            f.gate.check_and_reserve(&req),
            Err(TradeError::ExposureLimitExceeded(_))
        ));
    }
}

// =============================================================================
// Runtime Configuration — engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Meridian execution engine: FIX session
// definitions, the LP roster, account and symbol risk limits, routing rules
// and the SOR / engine tunables.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.  Validation happens once, at
// construction — not on every call site.
// =============================================================================

use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{Datelike, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_heart_bt_int() -> u64 {
    30
}

fn default_store_path() -> String {
    "fix_store".to_string()
}

fn default_group() -> String {
    "default".to_string()
}

fn default_starting_balance() -> f64 {
    10_000.0
}

fn default_max_position_size() -> f64 {
    50.0
}

fn default_max_total_exposure() -> f64 {
    5_000_000.0
}

fn default_max_positions_per_symbol() -> u32 {
    10
}

fn default_max_total_positions() -> u32 {
    50
}

fn default_max_daily_loss() -> f64 {
    1_000.0
}

fn default_max_daily_trades() -> u32 {
    200
}

fn default_max_leverage() -> f64 {
    100.0
}

fn default_min_lot() -> f64 {
    0.01
}

fn default_max_lot() -> f64 {
    100.0
}

fn default_lot_step() -> f64 {
    0.01
}

fn default_pip_factor() -> f64 {
    10_000.0
}

fn default_contract_size() -> f64 {
    100_000.0
}

fn default_margin_rate() -> f64 {
    0.01
}

fn default_stale_threshold_ms() -> i64 {
    5_000
}

fn default_coalesce_interval_ms() -> u64 {
    50
}

fn default_score_weights() -> [f64; 4] {
    [0.4, 0.3, 0.2, 0.1]
}

fn default_quarantine_cooldown_secs() -> u64 {
    60
}

fn default_ewma_window() -> u32 {
    200
}

fn default_slippage_cap_pips() -> f64 {
    50.0
}

fn default_latency_cap_ms() -> f64 {
    1_000.0
}

fn default_degraded_threshold() -> f64 {
    0.5
}

fn default_quarantine_threshold() -> f64 {
    0.3
}

fn default_consecutive_reject_limit() -> u32 {
    3
}

fn default_consecutive_reject_window_secs() -> i64 {
    10
}

fn default_send_timeout_ms() -> u64 {
    10_000
}

fn default_recovery_timeout_ms() -> u64 {
    60_000
}

fn default_fat_finger_multiplier() -> f64 {
    10.0
}

fn default_fat_finger_history() -> usize {
    20
}

// =============================================================================
// FIX sessions & LPs
// =============================================================================

/// One long-lived FIX 4.4 session to a liquidity provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixSessionConfig {
    /// LP id this session belongs to (matches `LpConfig::id`).
    pub id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    pub sender_comp_id: String,
    pub target_comp_id: String,
    /// Heartbeat interval in seconds (FIX tag 108).
    #[serde(default = "default_heart_bt_int")]
    pub heart_bt_int: u64,
    /// Send ResetSeqNumFlag=Y on logon and zero the counters.
    #[serde(default)]
    pub reset_on_logon: bool,
    /// Directory for the per-session sequence store.
    #[serde(default = "default_store_path")]
    pub store_path: String,
}

/// A liquidity provider known to the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LpConfig {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    /// If set, the LP only quotes / accepts these symbols.
    #[serde(default)]
    pub symbols: Option<Vec<String>>,
}

/// A non-FIX quote feed delivering normalized JSON quotes over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsFeedConfig {
    /// LP id the quotes are attributed to.
    pub lp_id: String,
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

// =============================================================================
// Risk limits
// =============================================================================

/// Per-account risk limits consulted by the pre-trade gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRiskLimits {
    #[serde(default = "default_max_position_size")]
    pub max_position_size: f64,
    /// Maximum total notional exposure across all open positions.
    #[serde(default = "default_max_total_exposure")]
    pub max_total_exposure: f64,
    #[serde(default = "default_max_positions_per_symbol")]
    pub max_positions_per_symbol: u32,
    #[serde(default = "default_max_total_positions")]
    pub max_total_positions: u32,
    /// Daily realized loss cap; breaching it trips the account kill switch.
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: f64,
    #[serde(default = "default_max_daily_trades")]
    pub max_daily_trades: u32,
    /// When set, only these symbols may be traded.
    #[serde(default)]
    pub allowed_symbols: Option<Vec<String>>,
    #[serde(default)]
    pub denied_symbols: Vec<String>,
    #[serde(default)]
    pub kill_switch_enabled: bool,
    #[serde(default = "default_max_leverage")]
    pub max_leverage: f64,
}

impl Default for AccountRiskLimits {
    fn default() -> Self {
        Self {
            max_position_size: default_max_position_size(),
            max_total_exposure: default_max_total_exposure(),
            max_positions_per_symbol: default_max_positions_per_symbol(),
            max_total_positions: default_max_total_positions(),
            max_daily_loss: default_max_daily_loss(),
            max_daily_trades: default_max_daily_trades(),
            allowed_symbols: None,
            denied_symbols: Vec::new(),
            kill_switch_enabled: false,
            max_leverage: default_max_leverage(),
        }
    }
}

/// A trading account and its limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub account_id: String,
    /// Routing group (matched against routing-rule group patterns).
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default = "default_starting_balance")]
    pub starting_balance: f64,
    #[serde(default)]
    pub limits: AccountRiskLimits,
}

/// Trading-hours window in UTC. `always_open` short-circuits the rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingHours {
    #[serde(default = "default_true")]
    pub always_open: bool,
    /// Opening hour, 0-23 UTC.
    #[serde(default)]
    pub open_hour_utc: u32,
    /// Closing hour, 1-24 UTC (exclusive).
    #[serde(default)]
    pub close_hour_utc: u32,
    #[serde(default)]
    pub trade_weekends: bool,
}

impl Default for TradingHours {
    fn default() -> Self {
        Self {
            always_open: true,
            open_hour_utc: 0,
            close_hour_utc: 24,
            trade_weekends: false,
        }
    }
}

impl TradingHours {
    /// Whether the market is open at the given UTC time.
    pub fn is_open(&self, now: chrono::DateTime<Utc>) -> bool {
        if self.always_open {
            return true;
        }
        if !self.trade_weekends
            && matches!(now.weekday(), Weekday::Sat | Weekday::Sun)
        {
            return false;
        }
        let hour = now.hour();
        hour >= self.open_hour_utc && hour < self.close_hour_utc
    }
}

/// Volatility circuit breaker: block new orders when the price moved more
/// than `price_change_pct` within `window_secs`, for `cooldown_secs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub price_change_pct: f64,
    pub window_secs: i64,
    pub cooldown_secs: i64,
}

/// Per-symbol trading parameters and limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolConfig {
    pub symbol: String,
    #[serde(default = "default_min_lot")]
    pub min_lot: f64,
    #[serde(default = "default_max_lot")]
    pub max_lot: f64,
    #[serde(default = "default_lot_step")]
    pub lot_step: f64,
    /// Price units per pip (10_000 for 5-digit FX, 100 for JPY pairs, ...).
    #[serde(default = "default_pip_factor")]
    pub pip_factor: f64,
    /// Units of base per 1.0 lot.
    #[serde(default = "default_contract_size")]
    pub contract_size: f64,
    /// Margin requirement as a fraction of notional.
    #[serde(default = "default_margin_rate")]
    pub margin_rate: f64,
    /// B-book markup applied on top of the aggregated book, in pips.
    #[serde(default)]
    pub markup_pips: f64,
    #[serde(default = "default_max_position_size")]
    pub max_position_size: f64,
    #[serde(default = "default_max_total_exposure")]
    pub max_exposure: f64,
    #[serde(default)]
    pub trading_hours: TradingHours,
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl SymbolConfig {
    /// A sensible default row for symbols not listed in the config file.
    pub fn fallback(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            min_lot: default_min_lot(),
            max_lot: default_max_lot(),
            lot_step: default_lot_step(),
            pip_factor: default_pip_factor(),
            contract_size: default_contract_size(),
            margin_rate: default_margin_rate(),
            markup_pips: 0.0,
            max_position_size: default_max_position_size(),
            max_exposure: default_max_total_exposure(),
            trading_hours: TradingHours::default(),
            circuit_breaker: None,
        }
    }
}

// =============================================================================
// Routing rules
// =============================================================================

/// Rule action: which book the order goes to, or an outright reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteAction {
    A,
    B,
    C,
    Reject,
}

fn default_star() -> String {
    "*".to_string()
}

/// One routing rule. Rules are evaluated in descending `priority`; the first
/// match wins. Patterns are exact strings or `*`-suffixed prefixes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: String,
    #[serde(default = "default_star")]
    pub group_pattern: String,
    #[serde(default = "default_star")]
    pub symbol_pattern: String,
    #[serde(default)]
    pub volume_min: f64,
    #[serde(default)]
    pub volume_max: Option<f64>,
    pub action: RouteAction,
    #[serde(default)]
    pub target_lp: Option<String>,
    /// Fraction of notional hedged externally (C rules only), 0.0-1.0.
    #[serde(default)]
    pub hedge_percent: Option<f64>,
    #[serde(default)]
    pub priority: i32,
}

// =============================================================================
// SOR / engine tunables
// =============================================================================

/// Quote aggregation and LP scoring settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SorConfig {
    /// A quote older than this is stale and excluded from the book.
    #[serde(default = "default_stale_threshold_ms")]
    pub stale_threshold_ms: i64,
    /// Minimum interval between aggregated-quote publications per symbol.
    #[serde(default = "default_coalesce_interval_ms")]
    pub coalesce_interval_ms: u64,
    /// Weights for fill rate / slippage / latency / reject rate.
    #[serde(default = "default_score_weights")]
    pub score_weights: [f64; 4],
    #[serde(default = "default_quarantine_cooldown_secs")]
    pub quarantine_cooldown_secs: u64,
    /// EWMA window as an equivalent sample count.
    #[serde(default = "default_ewma_window")]
    pub ewma_window: u32,
    #[serde(default = "default_slippage_cap_pips")]
    pub slippage_cap_pips: f64,
    #[serde(default = "default_latency_cap_ms")]
    pub latency_cap_ms: f64,
    #[serde(default = "default_degraded_threshold")]
    pub degraded_threshold: f64,
    #[serde(default = "default_quarantine_threshold")]
    pub quarantine_threshold: f64,
    #[serde(default = "default_consecutive_reject_limit")]
    pub consecutive_reject_limit: u32,
    #[serde(default = "default_consecutive_reject_window_secs")]
    pub consecutive_reject_window_secs: i64,
}

impl Default for SorConfig {
    fn default() -> Self {
        Self {
            stale_threshold_ms: default_stale_threshold_ms(),
            coalesce_interval_ms: default_coalesce_interval_ms(),
            score_weights: default_score_weights(),
            quarantine_cooldown_secs: default_quarantine_cooldown_secs(),
            ewma_window: default_ewma_window(),
            slippage_cap_pips: default_slippage_cap_pips(),
            latency_cap_ms: default_latency_cap_ms(),
            degraded_threshold: default_degraded_threshold(),
            quarantine_threshold: default_quarantine_threshold(),
            consecutive_reject_limit: default_consecutive_reject_limit(),
            consecutive_reject_window_secs: default_consecutive_reject_window_secs(),
        }
    }
}

/// Whether fills against an existing same-side position merge into it or
/// always open a separate position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NettingMode {
    Netting,
    Hedging,
}

impl Default for NettingMode {
    fn default() -> Self {
        Self::Netting
    }
}

/// A-book / B-book execution tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// No ExecutionReport within this window after SENT → UNKNOWN.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// UNKNOWN unresolved for this long → REJECTED(Timeout).
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    /// Resubmit once to the next SOR candidate on a transient LP reject.
    #[serde(default = "default_true")]
    pub auto_failover: bool,
    #[serde(default)]
    pub netting_mode: NettingMode,
    /// Requested volume above `multiplier × rolling average` is suspicious.
    #[serde(default = "default_fat_finger_multiplier")]
    pub fat_finger_multiplier: f64,
    /// How many accepted volumes feed the rolling average.
    #[serde(default = "default_fat_finger_history")]
    pub fat_finger_history: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            send_timeout_ms: default_send_timeout_ms(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            auto_failover: true,
            netting_mode: NettingMode::default(),
            fat_finger_multiplier: default_fat_finger_multiplier(),
            fat_finger_history: default_fat_finger_history(),
        }
    }
}

// =============================================================================
// Top-level config
// =============================================================================

/// The full engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub fix_sessions: Vec<FixSessionConfig>,
    #[serde(default)]
    pub lps: Vec<LpConfig>,
    #[serde(default)]
    pub ws_feeds: Vec<WsFeedConfig>,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub symbols: Vec<SymbolConfig>,
    #[serde(default)]
    pub routing_rules: Vec<RoutingRule>,
    #[serde(default)]
    pub sor: SorConfig,
    #[serde(default)]
    pub engine: EngineSettings,
}

impl RuntimeConfig {
    /// Load from a JSON file and validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).with_context(|| {
            format!("failed to read config file {}", path.as_ref().display())
        })?;
        let config: Self =
            serde_json::from_str(&raw).context("failed to parse config JSON")?;
        config.validate()?;
        info!(
            fix_sessions = config.fix_sessions.len(),
            lps = config.lps.len(),
            accounts = config.accounts.len(),
            routing_rules = config.routing_rules.len(),
            "runtime config loaded"
        );
        Ok(config)
    }

    /// Save atomically: write to `<path>.tmp`, then rename over `path`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        let json =
            serde_json::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(&tmp, &json)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path).with_context(|| {
            format!("failed to rename {} over {}", tmp.display(), path.display())
        })?;
        Ok(())
    }

    /// Validate cross-field constraints. Called at load; call again after any
    /// hot reload before swapping the config in.
    pub fn validate(&self) -> Result<()> {
        let weight_sum: f64 = self.sor.score_weights.iter().sum();
        if weight_sum <= 0.0 {
            bail!("sor.score_weights must sum to a positive value");
        }
        if self.sor.stale_threshold_ms <= 0 {
            bail!("sor.stale_threshold_ms must be positive");
        }
        for session in &self.fix_sessions {
            if !self.lps.iter().any(|lp| lp.id == session.id) {
                bail!("fix session '{}' has no matching LP entry", session.id);
            }
            if session.heart_bt_int == 0 {
                bail!("fix session '{}' has zero heart_bt_int", session.id);
            }
        }
        for rule in &self.routing_rules {
            if rule.action == RouteAction::C {
                match rule.hedge_percent {
                    Some(h) if (0.0..=1.0).contains(&h) => {}
                    _ => bail!(
                        "routing rule '{}' is C-book but hedge_percent is not in 0..=1",
                        rule.id
                    ),
                }
            }
            if let Some(max) = rule.volume_max {
                if max < rule.volume_min {
                    bail!("routing rule '{}' has volume_max < volume_min", rule.id);
                }
            }
        }
        for sym in &self.symbols {
            if sym.lot_step <= 0.0 || sym.min_lot <= 0.0 || sym.max_lot < sym.min_lot {
                bail!("symbol '{}' has invalid lot bounds", sym.symbol);
            }
        }
        Ok(())
    }

    /// Resolve per-symbol parameters, falling back to defaults for unknown
    /// symbols.
    pub fn symbol(&self, symbol: &str) -> SymbolConfig {
        self.symbols
            .iter()
            .find(|s| s.symbol == symbol)
            .cloned()
            .unwrap_or_else(|| SymbolConfig::fallback(symbol))
    }

    /// Resolve an account's config; unknown accounts get the default limits
    /// and the default group.
    pub fn account(&self, account_id: &str) -> AccountConfig {
        self.accounts
            .iter()
            .find(|a| a.account_id == account_id)
            .cloned()
            .unwrap_or_else(|| AccountConfig {
                account_id: account_id.to_string(),
                group: default_group(),
                starting_balance: default_starting_balance(),
                limits: AccountRiskLimits::default(),
            })
    }

    /// EWMA alpha derived from the configured window (~N samples).
    pub fn ewma_alpha(&self) -> f64 {
        2.0 / (self.sor.ewma_window as f64 + 1.0)
    }
}

// =============================================================================
// Tests
// =============================================================================

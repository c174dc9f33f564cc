// =============================================================================
// Shared types used across the Meridian execution engine
// =============================================================================
//
// Identifier conventions:
//   - OrderId / PositionId / ClOrdId are server-generated UUID v4 strings.
//   - ExecId is assigned by the liquidity provider and used for deduplication.
//   - Symbols are upper-case strings ("EURUSD"); LP ids come from config.
// =============================================================================

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generate a fresh server-side identifier (orders, positions).
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate a fresh ClOrdID for a wire-level submission.
///
/// Every submission to an LP gets a brand new ClOrdID — including failover
/// resubmits and cancel/replace requests. A ClOrdID is never reused.
pub fn new_cl_ord_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Current wall-clock time in Unix milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Current wall-clock time as an RFC 3339 string (serialized timestamps).
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

// ---------------------------------------------------------------------------
// Order enums
// ---------------------------------------------------------------------------

/// Direction of an order or position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The opposite direction (used when closing a position).
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// +1.0 for longs, -1.0 for shorts. PnL = direction × (close - open) × volume.
    pub fn direction(self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }

    /// FIX tag 54 value.
    pub fn fix_value(self) -> &'static str {
        match self {
            Self::Buy => "1",
            Self::Sell => "2",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

impl OrderType {
    /// FIX tag 40 value.
    pub fn fix_value(self) -> &'static str {
        match self {
            Self::Market => "1",
            Self::Limit => "2",
            Self::Stop => "3",
            Self::StopLimit => "4",
        }
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "MARKET"),
            Self::Limit => write!(f, "LIMIT"),
            Self::Stop => write!(f, "STOP"),
            Self::StopLimit => write!(f, "STOP_LIMIT"),
        }
    }
}

/// Time in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    /// Good till canceled.
    Gtc,
    /// Immediate or cancel.
    Ioc,
    /// Fill or kill.
    Fok,
}

impl Default for TimeInForce {
    fn default() -> Self {
        Self::Gtc
    }
}

impl TimeInForce {
    /// FIX tag 59 value.
    pub fn fix_value(self) -> &'static str {
        match self {
            Self::Gtc => "1",
            Self::Ioc => "3",
            Self::Fok => "4",
        }
    }
}

impl std::fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gtc => write!(f, "GTC"),
            Self::Ioc => write!(f, "IOC"),
            Self::Fok => write!(f, "FOK"),
        }
    }
}

/// Which execution path an order was routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookKind {
    /// Externalized to an upstream LP.
    A,
    /// Internalized; the platform is the counterparty.
    B,
    /// Hybrid: a configured fraction of the notional is hedged externally.
    C,
}

impl std::fmt::Display for BookKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
            Self::C => write!(f, "C"),
        }
    }
}

// ---------------------------------------------------------------------------
// Order lifecycle
// ---------------------------------------------------------------------------

/// Order state machine values.
///
/// Transitions are monotonic:
///   New → Routed → Sent → Acknowledged → PartiallyFilled* → Filled
/// with Rejected / Canceled / Expired as alternative terminals and Unknown as
/// the timeout-recovery state (resolved via OrderStatusRequest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    Routed,
    Sent,
    Acknowledged,
    PartiallyFilled,
    Filled,
    Rejected,
    Canceled,
    Expired,
    Unknown,
}

impl OrderStatus {
    /// Terminal statuses freeze the order; no further mutation is allowed.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Rejected | Self::Canceled | Self::Expired
        )
    }

    /// Monotonic state machine guard. Terminal states allow nothing; the only
    /// self-loop is PARTIALLY_FILLED on further partials.
    pub fn can_transition_to(self, to: OrderStatus) -> bool {
        use OrderStatus::*;
        if self.is_terminal() {
            return false;
        }
        if self == to {
            return self == PartiallyFilled;
        }
        matches!(
            (self, to),
            (New, Routed | Rejected | Canceled | Expired)
                | (Routed, Sent | Acknowledged | PartiallyFilled | Filled | Rejected | Canceled | Expired)
                // Some LPs skip the explicit ACK and report the fill directly.
                | (Sent, Acknowledged | PartiallyFilled | Filled | Rejected | Canceled | Unknown)
                | (Acknowledged, PartiallyFilled | Filled | Rejected | Canceled | Expired | Unknown)
                | (PartiallyFilled, Filled | Rejected | Canceled | Expired | Unknown)
                | (Unknown, Acknowledged | PartiallyFilled | Filled | Rejected | Canceled | Expired)
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::Routed => "ROUTED",
            Self::Sent => "SENT",
            Self::Acknowledged => "ACKNOWLEDGED",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::Filled => "FILLED",
            Self::Rejected => "REJECTED",
            Self::Canceled => "CANCELED",
            Self::Expired => "EXPIRED",
            Self::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

/// A client order tracked by the execution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Server-assigned id, stable across wire-level retries.
    pub id: String,
    pub account_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub requested_volume: f64,
    /// `requested_volume - filled_volume`, never negative.
    pub remaining_volume: f64,
    /// Limit price for non-market orders.
    #[serde(default)]
    pub requested_price: Option<f64>,
    /// Trigger price for stop / stop-limit orders.
    #[serde(default)]
    pub trigger_price: Option<f64>,
    #[serde(default)]
    pub time_in_force: TimeInForce,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    pub routing: BookKind,
    /// LP this order was sent to (A/C book only).
    #[serde(default)]
    pub target_lp: Option<String>,
    /// Fraction of the notional hedged externally (C book only).
    #[serde(default)]
    pub hedge_percent: Option<f64>,
    /// ClOrdID of the latest wire submission (A/C book only).
    #[serde(default)]
    pub cl_ord_id: Option<String>,
    /// Position this order is closing, if it is a close request.
    #[serde(default)]
    pub closing_position_id: Option<String>,
    pub status: OrderStatus,
    pub created_at: String,
    /// Unix millis of the wire send, for latency measurement.
    #[serde(default)]
    pub sent_at_ms: Option<i64>,
    pub last_update_at: String,
    #[serde(default)]
    pub filled_volume: f64,
    /// Volume-weighted average price across fills.
    #[serde(default)]
    pub avg_fill_price: f64,
    #[serde(default)]
    pub partial_fill_count: u32,
    #[serde(default)]
    pub last_reject_reason: Option<String>,
}

/// Client order input accepted by the execution engine (REST body shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub account_id: String,
    pub symbol: String,
    pub side: Side,
    #[serde(default = "default_market")]
    pub order_type: OrderType,
    pub volume: f64,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub trigger_price: Option<f64>,
    #[serde(default)]
    pub time_in_force: TimeInForce,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    /// Set when this order closes (part of) an existing position.
    #[serde(default)]
    pub closing_position_id: Option<String>,
}

fn default_market() -> OrderType {
    OrderType::Market
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_opposite_and_direction() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
        assert_eq!(Side::Buy.direction(), 1.0);
        assert_eq!(Side::Sell.direction(), -1.0);
    }

    #[test]
    fn terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
        assert!(!OrderStatus::Unknown.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
        assert!(!OrderStatus::Sent.is_terminal());
    }

    #[test]
    fn cl_ord_ids_are_unique() {
        let a = new_cl_ord_id();
        let b = new_cl_ord_id();
        assert_ne!(a, b);
        // Simple form: no hyphens on the wire.
        assert!(!a.contains('-'));
    }

    #[test]
    fn fix_values() {
        assert_eq!(Side::Buy.fix_value(), "1");
        assert_eq!(Side::Sell.fix_value(), "2");
        assert_eq!(OrderType::Market.fix_value(), "1");
        assert_eq!(OrderType::StopLimit.fix_value(), "4");
        assert_eq!(TimeInForce::Ioc.fix_value(), "3");
    }
}

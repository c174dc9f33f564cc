// =============================================================================
// Error taxonomy surfaced to order-placement callers
// =============================================================================
//
// Every terminal error carries a stable kind (used for HTTP mapping, metric
// tagging and dashboard display) plus a free-text cause. Pre-trade errors are
// returned synchronously and never mutate the position ledger.
// =============================================================================

use serde::Serialize;
use thiserror::Error;

/// Stable error kinds for order placement, cancelation and position close.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TradeError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("kill switch active: {0}")]
    KillSwitchActive(String),

    #[error("market closed for {0}")]
    MarketClosed(String),

    #[error("symbol not permitted: {0}")]
    SymbolNotPermitted(String),

    #[error("invalid volume: {0}")]
    InvalidVolume(String),

    #[error("fat finger suspected: {0}")]
    FatFingerSuspected(String),

    #[error("position limit exceeded: {0}")]
    PositionLimitExceeded(String),

    #[error("exposure limit exceeded: {0}")]
    ExposureLimitExceeded(String),

    #[error("insufficient margin: {0}")]
    InsufficientMargin(String),

    #[error("daily limit exceeded: {0}")]
    DailyLimitExceeded(String),

    #[error("circuit breaker tripped: {0}")]
    CircuitBreakerTripped(String),

    #[error("leverage exceeded: {0}")]
    LeverageExceeded(String),

    #[error("routing rejected: {0}")]
    RoutingRejected(String),

    #[error("no eligible LP for {0}")]
    NoEligibleLp(String),

    #[error("no internal price for {0}")]
    NoPrice(String),

    #[error("LP rejected order: {0}")]
    LpReject(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("order not cancelable: {0}")]
    OrderNotCancelable(String),

    #[error("position not found: {0}")]
    PositionNotFound(String),

    #[error("FIX session down: {0}")]
    SessionDown(String),
}

impl TradeError {
    /// Stable machine-readable kind, independent of the free-text cause.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::KillSwitchActive(_) => "KillSwitchActive",
            Self::MarketClosed(_) => "MarketClosed",
            Self::SymbolNotPermitted(_) => "SymbolNotPermitted",
            Self::InvalidVolume(_) => "InvalidVolume",
            Self::FatFingerSuspected(_) => "FatFingerSuspected",
            Self::PositionLimitExceeded(_) => "PositionLimitExceeded",
            Self::ExposureLimitExceeded(_) => "ExposureLimitExceeded",
            Self::InsufficientMargin(_) => "InsufficientMargin",
            Self::DailyLimitExceeded(_) => "DailyLimitExceeded",
            Self::CircuitBreakerTripped(_) => "CircuitBreakerTripped",
            Self::LeverageExceeded(_) => "LeverageExceeded",
            Self::RoutingRejected(_) => "RoutingRejected",
            Self::NoEligibleLp(_) => "NoEligibleLP",
            Self::NoPrice(_) => "NoPrice",
            Self::LpReject(_) => "LPReject",
            Self::Timeout(_) => "Timeout",
            Self::OrderNotFound(_) => "OrderNotFound",
            Self::OrderNotCancelable(_) => "OrderNotCancelable",
            Self::PositionNotFound(_) => "PositionNotFound",
            Self::SessionDown(_) => "SessionDown",
        }
    }

    /// Wire form for the REST surface: `{ "error": kind, "message": cause }`.
    pub fn to_wire(&self) -> TradeErrorBody {
        TradeErrorBody {
            error: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Serialized error body returned by the REST API.
#[derive(Debug, Clone, Serialize)]
pub struct TradeErrorBody {
    pub error: &'static str,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_stable_across_causes() {
        let a = TradeError::NoEligibleLp("EURUSD".into());
        let b = TradeError::NoEligibleLp("XAUUSD".into());
        assert_eq!(a.kind(), b.kind());
        assert_eq!(a.kind(), "NoEligibleLP");
    }

    #[test]
    fn wire_body_carries_kind_and_message() {
        let err = TradeError::InvalidVolume("0.0031 below lot step".into());
        let body = err.to_wire();
        assert_eq!(body.error, "InvalidVolume");
        assert!(body.message.contains("lot step"));
    }
}

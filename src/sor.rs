// =============================================================================
// Smart Order Router — best executable price across healthy LPs
// =============================================================================
//
// Given (symbol, side, volume), builds the candidate list of LPs that:
//   - are enabled and support the symbol,
//   - are logged on and not quarantined,
//   - hold a fresh quote on the needed side,
//   - display sufficient volume (when volume is published at all).
//
// Candidates are ranked by effective price (lowest ask for BUY, highest bid
// for SELL), tie-broken by health score (higher first), then by latency EWMA
// (lower first). The full ranked list is returned so the A-book engine can
// fail over to the next-best candidate on reject or timeout.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::errors::TradeError;
use crate::lp_health::LpHealthTracker;
use crate::quotes::aggregator::QuoteAggregator;
use crate::runtime_config::RuntimeConfig;
use crate::types::Side;

/// One routable LP with the price it showed when the list was built.
#[derive(Debug, Clone, Serialize)]
pub struct RouteCandidate {
    pub lp: String,
    /// Effective price: ask for BUY, bid for SELL.
    pub price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub displayed_volume: Option<f64>,
    pub score: f64,
    pub latency_ms: f64,
    pub quote_ts_ms: i64,
}

/// Stateless router over the aggregator, the health tracker and the LP roster.
pub struct SmartOrderRouter {
    aggregator: Arc<QuoteAggregator>,
    health: Arc<LpHealthTracker>,
    config: Arc<RwLock<RuntimeConfig>>,
}

impl SmartOrderRouter {
    pub fn new(
        aggregator: Arc<QuoteAggregator>,
        health: Arc<LpHealthTracker>,
        config: Arc<RwLock<RuntimeConfig>>,
    ) -> Self {
        Self {
            aggregator,
            health,
            config,
        }
    }

    /// Ranked candidate list for an order. Empty input conditions produce
    /// `NoEligibleLP`; the first element is the routing choice and the rest
    /// are failover candidates in order.
    pub fn select_candidates(
        &self,
        symbol: &str,
        side: Side,
        volume: f64,
    ) -> Result<Vec<RouteCandidate>, TradeError> {
        let lps = self.config.read().lps.clone();
        let quotes = self.aggregator.fresh_quotes(symbol);

        let mut candidates: Vec<RouteCandidate> = quotes
            .iter()
            .filter_map(|quote| {
                let lp_cfg = lps.iter().find(|lp| lp.id == quote.lp)?;
                if !lp_cfg.enabled {
                    return None;
                }
                if let Some(symbols) = &lp_cfg.symbols {
                    if !symbols.iter().any(|s| s == symbol) {
                        return None;
                    }
                }
                if !self.health.order_eligible(&quote.lp) {
                    return None;
                }

                let (price, displayed) = match side {
                    Side::Buy => (quote.ask, quote.ask_volume),
                    Side::Sell => (quote.bid, quote.bid_volume),
                };
                if price <= 0.0 {
                    return None;
                }
                // Displayed volume is advisory: when the LP publishes it and
                // it cannot cover the order, skip the LP.
                if let Some(shown) = displayed {
                    if shown < volume {
                        return None;
                    }
                }

                Some(RouteCandidate {
                    lp: quote.lp.clone(),
                    price,
                    displayed_volume: displayed,
                    score: self.health.score(&quote.lp),
                    latency_ms: self.health.latency_ewma(&quote.lp),
                    quote_ts_ms: quote.ts_ms,
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            let price_order = match side {
                Side::Buy => a.price.total_cmp(&b.price),
                Side::Sell => b.price.total_cmp(&a.price),
            };
            price_order
                .then_with(|| b.score.total_cmp(&a.score))
                .then_with(|| a.latency_ms.total_cmp(&b.latency_ms))
        });

        if candidates.is_empty() {
            return Err(TradeError::NoEligibleLp(format!("{symbol} {side} {volume}")));
        }

        debug!(
            symbol,
            side = %side,
            volume,
            chosen = %candidates[0].lp,
            alternatives = candidates.len() - 1,
            "SOR candidates built"
        );
        Ok(candidates)
    }

    /// Best single candidate.
    pub fn select_lp(
        &self,
        symbol: &str,
        side: Side,
        volume: f64,
    ) -> Result<RouteCandidate, TradeError> {
        Ok(self.select_candidates(symbol, side, volume)?.remove(0))
    }
}

impl std::fmt::Debug for SmartOrderRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartOrderRouter").finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

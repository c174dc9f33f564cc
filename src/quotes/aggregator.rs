// =============================================================================
// Quote Aggregator — multi-LP top-of-book with staleness and coalescing
// =============================================================================
//
// Consumes MarketData messages from the FIX sessions and normalized quotes
// from the WebSocket adapters. For each (symbol, LP) only the latest quote is
// kept; a single writer per LP guarantees monotonic timestamps per source
// (late quotes are dropped, never applied backwards).
//
// The aggregated top-of-book is the highest fresh bid and lowest fresh ask
// across quote-eligible LPs, each side tagged with its source LP. A side with
// no fresh eligible quote is unavailable (`None`).
//
// Publication is coalesced: symbols touched since the last pass are published
// at most once per `coalesce_interval_ms` (default 50 ms) to protect
// downstream consumers. Staleness (default 5 s) is a separate, much larger
// threshold.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, warn};

use crate::events::{EngineEvent, EventBus};
use crate::fix::message::{tags, FixMessage};
use crate::lp_health::LpHealthTracker;
use crate::types::now_ms;

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

/// Latest quote from one LP for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub lp: String,
    pub bid: f64,
    pub ask: f64,
    #[serde(default)]
    pub bid_volume: Option<f64>,
    #[serde(default)]
    pub ask_volume: Option<f64>,
    /// Unix millis when the quote was received.
    pub ts_ms: i64,
}

/// One side of the aggregated book, tagged with its source LP.
#[derive(Debug, Clone, Serialize)]
pub struct BookSide {
    pub lp: String,
    pub price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    pub ts_ms: i64,
}

/// Aggregated top-of-book for one symbol.
#[derive(Debug, Clone, Serialize)]
pub struct TopOfBook {
    pub symbol: String,
    /// Highest fresh bid; `None` when the side is unavailable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid: Option<BookSide>,
    /// Lowest fresh ask; `None` when the side is unavailable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask: Option<BookSide>,
    pub ts_ms: i64,
}

impl TopOfBook {
    /// Spread in price units when both sides are available. A negative value
    /// (crossed book across LPs) is possible and observable downstream.
    pub fn spread(&self) -> Option<f64> {
        match (&self.bid, &self.ask) {
            (Some(bid), Some(ask)) => Some(ask.price - bid.price),
            _ => None,
        }
    }

    pub fn mid(&self) -> Option<f64> {
        match (&self.bid, &self.ask) {
            (Some(bid), Some(ask)) => Some((bid.price + ask.price) / 2.0),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

/// Thread-safe quote table shared by the SOR, the B-book engine and the push
/// surface.
pub struct QuoteAggregator {
    /// symbol → (LP → latest quote).
    quotes: RwLock<HashMap<String, HashMap<String, Quote>>>,
    /// Symbols touched since the last fan-out pass.
    dirty: Mutex<HashSet<String>>,
    stale_threshold_ms: i64,
    health: Arc<LpHealthTracker>,
    events: EventBus,
}

impl QuoteAggregator {
    pub fn new(stale_threshold_ms: i64, health: Arc<LpHealthTracker>, events: EventBus) -> Self {
        Self {
            quotes: RwLock::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
            stale_threshold_ms,
            health,
            events,
        }
    }

    /// Apply one normalized quote. A quote older than the one already held
    /// for the same (symbol, LP) is dropped.
    pub fn apply_quote(&self, quote: Quote) {
        if quote.bid <= 0.0 && quote.ask <= 0.0 {
            debug!(symbol = %quote.symbol, lp = %quote.lp, "ignoring empty quote");
            return;
        }

        let symbol = quote.symbol.clone();
        {
            let mut table = self.quotes.write();
            let per_lp = table.entry(symbol.clone()).or_default();
            if let Some(existing) = per_lp.get(&quote.lp) {
                if quote.ts_ms < existing.ts_ms {
                    debug!(symbol = %symbol, lp = %quote.lp, "dropping out-of-order quote");
                    return;
                }
            }
            per_lp.insert(quote.lp.clone(), quote);
        }
        self.dirty.lock().insert(symbol);
    }

    /// Apply a FIX MarketData message (W snapshot or X incremental).
    ///
    /// Entries are flat repeating groups: 269 (type: 0=bid, 1=ask) opens an
    /// entry, 270 carries the price, 271 the size. An incremental refresh that
    /// only carries one side inherits the other side from the previous quote.
    pub fn apply_fix_market_data(&self, lp: &str, msg: &FixMessage) {
        let symbol = match msg.get(tags::SYMBOL) {
            Some(s) => s.to_string(),
            None => {
                warn!(lp = %lp, "MarketData without Symbol (55) — dropped");
                return;
            }
        };

        let mut bid: Option<(f64, Option<f64>)> = None;
        let mut ask: Option<(f64, Option<f64>)> = None;
        let mut current: Option<char> = None;
        let mut current_px: Option<f64> = None;
        let mut current_size: Option<f64> = None;

        let commit = |entry: Option<char>, px: Option<f64>, size: Option<f64>,
                          bid: &mut Option<(f64, Option<f64>)>,
                          ask: &mut Option<(f64, Option<f64>)>| {
            if let (Some(kind), Some(price)) = (entry, px) {
                match kind {
                    '0' => *bid = Some((price, size)),
                    '1' => *ask = Some((price, size)),
                    _ => {}
                }
            }
        };

        for (tag, value) in &msg.fields {
            match *tag {
                tags::MD_ENTRY_TYPE => {
                    commit(current, current_px, current_size, &mut bid, &mut ask);
                    current = value.chars().next();
                    current_px = None;
                    current_size = None;
                }
                tags::MD_ENTRY_PX => current_px = value.parse().ok(),
                tags::MD_ENTRY_SIZE => current_size = value.parse().ok(),
                _ => {}
            }
        }
        commit(current, current_px, current_size, &mut bid, &mut ask);

        if bid.is_none() && ask.is_none() {
            warn!(lp = %lp, symbol = %symbol, "MarketData carried no usable entries");
            return;
        }

        // Incremental refreshes may update a single side.
        let previous = self.quote_for(&symbol, lp);
        let (prev_bid, prev_bid_vol, prev_ask, prev_ask_vol) = match &previous {
            Some(q) => (q.bid, q.bid_volume, q.ask, q.ask_volume),
            None => (0.0, None, 0.0, None),
        };

        let (bid_px, bid_vol) = bid.map_or((prev_bid, prev_bid_vol), |(p, v)| (p, v));
        let (ask_px, ask_vol) = ask.map_or((prev_ask, prev_ask_vol), |(p, v)| (p, v));

        self.apply_quote(Quote {
            symbol,
            lp: lp.to_string(),
            bid: bid_px,
            ask: ask_px,
            bid_volume: bid_vol,
            ask_volume: ask_vol,
            ts_ms: now_ms(),
        });
    }

    /// Latest quote from one LP, regardless of freshness.
    pub fn quote_for(&self, symbol: &str, lp: &str) -> Option<Quote> {
        self.quotes
            .read()
            .get(symbol)
            .and_then(|per_lp| per_lp.get(lp))
            .cloned()
    }

    /// All fresh, quote-eligible quotes for a symbol (SOR candidate input).
    pub fn fresh_quotes(&self, symbol: &str) -> Vec<Quote> {
        let now = now_ms();
        self.quotes
            .read()
            .get(symbol)
            .map(|per_lp| {
                per_lp
                    .values()
                    .filter(|q| {
                        now - q.ts_ms <= self.stale_threshold_ms
                            && self.health.quote_eligible(&q.lp)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Aggregated top-of-book: best fresh bid and ask across eligible LPs.
    pub fn top_of_book(&self, symbol: &str) -> TopOfBook {
        let fresh = self.fresh_quotes(symbol);

        let bid = fresh
            .iter()
            .filter(|q| q.bid > 0.0)
            .max_by(|a, b| a.bid.total_cmp(&b.bid))
            .map(|q| BookSide {
                lp: q.lp.clone(),
                price: q.bid,
                volume: q.bid_volume,
                ts_ms: q.ts_ms,
            });

        let ask = fresh
            .iter()
            .filter(|q| q.ask > 0.0)
            .min_by(|a, b| a.ask.total_cmp(&b.ask))
            .map(|q| BookSide {
                lp: q.lp.clone(),
                price: q.ask,
                volume: q.ask_volume,
                ts_ms: q.ts_ms,
            });

        TopOfBook {
            symbol: symbol.to_string(),
            bid,
            ask,
            ts_ms: now_ms(),
        }
    }

    /// All symbols currently tracked.
    pub fn symbols(&self) -> Vec<String> {
        self.quotes.read().keys().cloned().collect()
    }

    /// Coalesced fan-out loop: publish the aggregated book for every dirty
    /// symbol, at most once per interval. Runs until the process stops.
    pub async fn run_fanout(self: Arc<Self>, coalesce_interval_ms: u64) {
        let mut tick = interval(Duration::from_millis(coalesce_interval_ms.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let touched: Vec<String> = self.dirty.lock().drain().collect();
            for symbol in touched {
                let book = self.top_of_book(&symbol);
                self.events.publish(EngineEvent::AggregatedQuote {
                    symbol: symbol.clone(),
                    book,
                });
            }
        }
    }
}

impl std::fmt::Debug for QuoteAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuoteAggregator")
            .field("symbols", &self.quotes.read().len())
            .field("stale_threshold_ms", &self.stale_threshold_ms)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

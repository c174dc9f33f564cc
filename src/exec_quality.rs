// =============================================================================
// Execution-Quality Recorder — per-order metrics feeding LP health
// =============================================================================
//
// Every terminal A-book order produces one record: requested vs filled price,
// slippage in pips, send-to-terminal latency, partial-fill count and the
// reject reason if any. Records live in a fixed rolling window; aggregates
// (fill rate, slippage distribution, latency percentiles, reject counts) are
// computed per LP on demand for the dashboard and external reporting.
//
// Each record is also forwarded to the health tracker, which keeps its own
// EWMA view for routing decisions.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

use crate::lp_health::{ExecutionSample, LpHealthTracker};
use crate::types::now_ms;

/// Rolling-window capacity (records across all LPs).
const WINDOW_CAPACITY: usize = 1_000;

/// One terminal-order observation.
#[derive(Debug, Clone, Serialize)]
pub struct QualityRecord {
    pub order_id: String,
    pub lp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_fill_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slippage_pips: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    pub partial_fill_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<String>,
    pub at_ms: i64,
}

impl QualityRecord {
    pub fn filled(&self) -> bool {
        self.reject_reason.is_none() && self.avg_fill_price.is_some()
    }
}

/// Per-LP aggregates over the rolling window.
#[derive(Debug, Clone, Serialize)]
pub struct LpQualityAggregate {
    pub lp: String,
    pub orders: usize,
    pub fills: usize,
    pub rejects: usize,
    pub fill_rate: f64,
    pub avg_slippage_pips: f64,
    pub slippage_p50: f64,
    pub slippage_p95: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub avg_partial_fills: f64,
}

/// The recorder. One instance per engine.
pub struct ExecutionQualityRecorder {
    window: RwLock<VecDeque<QualityRecord>>,
    health: Arc<LpHealthTracker>,
}

impl ExecutionQualityRecorder {
    pub fn new(health: Arc<LpHealthTracker>) -> Self {
        Self {
            window: RwLock::new(VecDeque::with_capacity(WINDOW_CAPACITY)),
            health,
        }
    }

    /// Record one terminal order and forward the sample to the health
    /// tracker.
    pub fn record(&self, record: QualityRecord) {
        let sample = if record.filled() {
            ExecutionSample::fill(
                record.slippage_pips.unwrap_or(0.0),
                record.latency_ms.unwrap_or(0.0),
            )
        } else {
            ExecutionSample::reject()
        };
        self.health.record_sample(&record.lp, sample);

        let mut window = self.window.write();
        if window.len() == WINDOW_CAPACITY {
            window.pop_front();
        }
        window.push_back(record);
    }

    /// Convenience constructor for a filled order.
    #[allow(clippy::too_many_arguments)]
    pub fn record_fill(
        &self,
        order_id: &str,
        lp: &str,
        requested_price: Option<f64>,
        avg_fill_price: f64,
        pip_factor: f64,
        latency_ms: Option<f64>,
        partial_fill_count: u32,
    ) {
        let slippage_pips =
            requested_price.map(|req| (req - avg_fill_price).abs() * pip_factor);
        self.record(QualityRecord {
            order_id: order_id.to_string(),
            lp: lp.to_string(),
            requested_price,
            avg_fill_price: Some(avg_fill_price),
            slippage_pips,
            latency_ms,
            partial_fill_count,
            reject_reason: None,
            at_ms: now_ms(),
        });
    }

    /// Convenience constructor for a rejected order.
    pub fn record_reject(&self, order_id: &str, lp: &str, reason: &str) {
        self.record(QualityRecord {
            order_id: order_id.to_string(),
            lp: lp.to_string(),
            requested_price: None,
            avg_fill_price: None,
            slippage_pips: None,
            latency_ms: None,
            partial_fill_count: 0,
            reject_reason: Some(reason.to_string()),
            at_ms: now_ms(),
        });
    }

    /// Most recent records, newest first.
    pub fn recent(&self, count: usize) -> Vec<QualityRecord> {
        self.window.read().iter().rev().take(count).cloned().collect()
    }

    /// Per-LP aggregates over the window.
    pub fn aggregates(&self) -> Vec<LpQualityAggregate> {
        let window = self.window.read();
        let mut by_lp: HashMap<&str, Vec<&QualityRecord>> = HashMap::new();
        for record in window.iter() {
            by_lp.entry(&record.lp).or_default().push(record);
        }

        let mut out: Vec<LpQualityAggregate> = by_lp
            .into_iter()
            .map(|(lp, records)| {
                let orders = records.len();
                let fills = records.iter().filter(|r| r.filled()).count();
                let rejects = records
                    .iter()
                    .filter(|r| r.reject_reason.is_some())
                    .count();

                let mut slippages: Vec<f64> =
                    records.iter().filter_map(|r| r.slippage_pips).collect();
                let mut latencies: Vec<f64> =
                    records.iter().filter_map(|r| r.latency_ms).collect();
                slippages.sort_by(f64::total_cmp);
                latencies.sort_by(f64::total_cmp);

                let avg_slippage = if slippages.is_empty() {
                    0.0
                } else {
                    slippages.iter().sum::<f64>() / slippages.len() as f64
                };
                let avg_partials = if fills == 0 {
                    0.0
                } else {
                    records
                        .iter()
                        .filter(|r| r.filled())
                        .map(|r| r.partial_fill_count as f64)
                        .sum::<f64>()
                        / fills as f64
                };

                LpQualityAggregate {
                    lp: lp.to_string(),
                    orders,
                    fills,
                    rejects,
                    fill_rate: if orders == 0 {
                        0.0
                    } else {
                        fills as f64 / orders as f64
                    },
                    avg_slippage_pips: avg_slippage,
                    slippage_p50: percentile(&slippages, 0.50),
                    slippage_p95: percentile(&slippages, 0.95),
                    latency_p50_ms: percentile(&latencies, 0.50),
                    latency_p95_ms: percentile(&latencies, 0.95),
                    latency_p99_ms: percentile(&latencies, 0.99),
                    avg_partial_fills: avg_partials,
                }
            })
            .collect();
        out.sort_by(|a, b| a.lp.cmp(&b.lp));
        out
    }
}

/// Nearest-rank percentile over a pre-sorted slice. Empty input yields 0.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (q * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

impl std::fmt::Debug for ExecutionQualityRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionQualityRecorder")
            .field("records", &self.window.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime_config::SorConfig;

    fn recorder() -> ExecutionQualityRecorder {
        let health = Arc::new(LpHealthTracker::new(&SorConfig::default(), 0.01));
        ExecutionQualityRecorder::new(health)
    }

    #[test]
    fn fill_slippage_is_priced_in_pips() {
        let r = recorder();
        // Requested 1.10020, filled 1.10022 → 0.2 pips at factor 10_000.
        r.record_fill("o1", "X", Some(1.10020), 1.10022, 10_000.0, Some(35.0), 1);
        let recent = r.recent(1);
        let slippage = recent[0].slippage_pips.unwrap();
        assert!((slippage - 0.2).abs() < 1e-6);
    }

    #[test]
    fn aggregates_split_by_lp() {
        let r = recorder();
        r.record_fill("o1", "X", Some(1.1), 1.1, 10_000.0, Some(30.0), 1);
        r.record_fill("o2", "X", Some(1.1), 1.1, 10_000.0, Some(50.0), 2);
        r.record_reject("o3", "Y", "NO_LIQUIDITY");

        let aggregates = r.aggregates();
        assert_eq!(aggregates.len(), 2);

        let x = aggregates.iter().find(|a| a.lp == "X").unwrap();
        assert_eq!(x.orders, 2);
        assert_eq!(x.fills, 2);
        assert_eq!(x.rejects, 0);
        assert_eq!(x.fill_rate, 1.0);
        assert!((x.avg_partial_fills - 1.5).abs() < 1e-9);

        let y = aggregates.iter().find(|a| a.lp == "Y").unwrap();
        assert_eq!(y.orders, 1);
        assert_eq!(y.rejects, 1);
        assert_eq!(y.fill_rate, 0.0);
    }

    #[test]
    fn latency_percentiles_are_ordered() {
        let r = recorder();
        for i in 1..=100 {
            r.record_fill("o", "X", None, 1.1, 10_000.0, Some(i as f64), 1);
        }
        let x = &r.aggregates()[0];
        assert!(x.latency_p50_ms <= x.latency_p95_ms);
        assert!(x.latency_p95_ms <= x.latency_p99_ms);
        assert!((x.latency_p50_ms - 50.0).abs() <= 1.0);
    }

    #[test]
    fn window_evicts_oldest() {
        let r = recorder();
        for i in 0..(WINDOW_CAPACITY + 10) {
            r.record_fill(&format!("o{i}"), "X", None, 1.1, 10_000.0, None, 1);
        }
        assert_eq!(r.aggregates()[0].orders, WINDOW_CAPACITY);
        let newest = r.recent(1);
        assert_eq!(newest[0].order_id, format!("o{}", WINDOW_CAPACITY + 9));
    }

    #[test]
    fn rejects_feed_health_tracker() {
        let health = Arc::new(LpHealthTracker::new(&SorConfig::default(), 0.5));
        let r = ExecutionQualityRecorder::new(health.clone());
        r.record_reject("o1", "X", "NO_LIQUIDITY");
        r.record_reject("o2", "X", "NO_LIQUIDITY");
        r.record_reject("o3", "X", "NO_LIQUIDITY");
        // Three consecutive rejects quarantine the LP via the tracker.
        assert!(health.is_quarantined("X"));
    }

    #[test]
    fn percentile_nearest_rank() {
        let values = vec![1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&values, 0.0), 1.0);
        assert_eq!(percentile(&values, 1.0), 4.0);
        assert_eq!(percentile(&values, 0.5), 3.0);
        assert_eq!(percentile(&[], 0.5), 0.0);
    }
}

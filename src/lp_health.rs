// =============================================================================
// LP Health Scorer — EWMA execution quality per liquidity provider
// =============================================================================
//
// For every completed A-book order the engine records whether it filled, the
// slippage in pips, the round-trip latency and whether it was rejected. The
// tracker maintains exponentially-weighted averages (α ≈ 2/(N+1), N from
// config) and derives a score in [0,1]:
//
//   score = 0.4·fill_rate + 0.3·(1 − slippage/cap)
//         + 0.2·(1 − latency/cap) + 0.1·(1 − reject_rate)
//
// An LP degrades below 0.5 and is quarantined below 0.3 — or after three
// consecutive rejects inside ten seconds. Quarantine lifts once the cooldown
// has elapsed AND the score is back at or above the degraded threshold.
//
// The score is a pure function of the recorded sample stream and the weights:
// replaying the same samples yields the same score.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::fix::session::SessionStatus;
use crate::runtime_config::SorConfig;
use crate::types::now_ms;

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

/// One completed-order observation against an LP.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionSample {
    pub filled: bool,
    pub rejected: bool,
    /// |requested − filled| × pip factor; only meaningful for fills.
    pub slippage_pips: Option<f64>,
    /// sent → terminal report, in milliseconds.
    pub latency_ms: Option<f64>,
}

impl ExecutionSample {
    pub fn fill(slippage_pips: f64, latency_ms: f64) -> Self {
        Self {
            filled: true,
            rejected: false,
            slippage_pips: Some(slippage_pips),
            latency_ms: Some(latency_ms),
        }
    }

    pub fn reject() -> Self {
        Self {
            filled: false,
            rejected: true,
            slippage_pips: None,
            latency_ms: None,
        }
    }
}

/// Externally visible connection state of an LP, health overlay included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LpConnectionState {
    Disconnected,
    Connecting,
    LoggedOn,
    Degraded,
    Quarantined,
}

impl std::fmt::Display for LpConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::LoggedOn => "LOGGED_ON",
            Self::Degraded => "DEGRADED",
            Self::Quarantined => "QUARANTINED",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
struct HealthRecord {
    fill_rate: f64,
    slippage_pips: f64,
    latency_ms: f64,
    reject_rate: f64,
    samples: u64,
    consecutive_rejects: u32,
    /// When the current reject streak started.
    reject_streak_started_ms: i64,
    quarantined_until_ms: Option<i64>,
    session: SessionStatus,
}

impl HealthRecord {
    fn new() -> Self {
        Self {
            fill_rate: 1.0,
            slippage_pips: 0.0,
            latency_ms: 0.0,
            reject_rate: 0.0,
            samples: 0,
            consecutive_rejects: 0,
            reject_streak_started_ms: 0,
            quarantined_until_ms: None,
            session: SessionStatus::Disconnected,
        }
    }
}

/// Serializable snapshot for the dashboard / REST surface.
#[derive(Debug, Clone, Serialize)]
pub struct LpHealthSnapshot {
    pub lp: String,
    pub state: LpConnectionState,
    pub score: f64,
    pub fill_rate: f64,
    pub slippage_pips: f64,
    pub latency_ms: f64,
    pub reject_rate: f64,
    pub samples: u64,
    pub consecutive_rejects: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quarantined_until_ms: Option<i64>,
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Process-wide health state keyed by LP id. Single writer per LP (the
/// execution-report consumer); many readers (SOR, aggregator, API).
pub struct LpHealthTracker {
    records: RwLock<HashMap<String, HealthRecord>>,
    alpha: f64,
    weights: [f64; 4],
    slippage_cap_pips: f64,
    latency_cap_ms: f64,
    degraded_threshold: f64,
    quarantine_threshold: f64,
    consecutive_reject_limit: u32,
    consecutive_reject_window_ms: i64,
    quarantine_cooldown_ms: i64,
}

impl LpHealthTracker {
    pub fn new(sor: &SorConfig, alpha: f64) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            alpha,
            weights: sor.score_weights,
            slippage_cap_pips: sor.slippage_cap_pips,
            latency_cap_ms: sor.latency_cap_ms,
            degraded_threshold: sor.degraded_threshold,
            quarantine_threshold: sor.quarantine_threshold,
            consecutive_reject_limit: sor.consecutive_reject_limit,
            consecutive_reject_window_ms: sor.consecutive_reject_window_secs * 1_000,
            quarantine_cooldown_ms: sor.quarantine_cooldown_secs as i64 * 1_000,
        }
    }

    /// Create the record for an LP. Idempotent.
    pub fn register(&self, lp: &str) {
        self.records
            .write()
            .entry(lp.to_string())
            .or_insert_with(HealthRecord::new);
    }

    /// Record a completed-order observation and re-evaluate quarantine.
    pub fn record_sample(&self, lp: &str, sample: ExecutionSample) {
        let now = now_ms();
        let mut records = self.records.write();
        let record = records
            .entry(lp.to_string())
            .or_insert_with(HealthRecord::new);

        let alpha = self.alpha;
        let ewma = |current: &mut f64, x: f64, samples: u64| {
            if samples == 0 {
                *current = x;
            } else {
                *current += alpha * (x - *current);
            }
        };

        ewma(
            &mut record.fill_rate,
            if sample.filled { 1.0 } else { 0.0 },
            record.samples,
        );
        ewma(
            &mut record.reject_rate,
            if sample.rejected { 1.0 } else { 0.0 },
            record.samples,
        );
        if let Some(slippage) = sample.slippage_pips {
            ewma(&mut record.slippage_pips, slippage.abs(), record.samples);
        }
        if let Some(latency) = sample.latency_ms {
            ewma(&mut record.latency_ms, latency.max(0.0), record.samples);
        }
        record.samples += 1;

        if sample.rejected {
            if record.consecutive_rejects == 0
                || now - record.reject_streak_started_ms > self.consecutive_reject_window_ms
            {
                record.consecutive_rejects = 0;
                record.reject_streak_started_ms = now;
            }
            record.consecutive_rejects += 1;
        } else {
            record.consecutive_rejects = 0;
        }

        let score = self.compute_score(record);
        let streak_trip = record.consecutive_rejects >= self.consecutive_reject_limit
            && now - record.reject_streak_started_ms <= self.consecutive_reject_window_ms;

        if record.quarantined_until_ms.is_none()
            && (score < self.quarantine_threshold || streak_trip)
        {
            record.quarantined_until_ms = Some(now + self.quarantine_cooldown_ms);
            warn!(
                lp = %lp,
                score,
                consecutive_rejects = record.consecutive_rejects,
                "LP quarantined"
            );
        }
    }

    /// Administrative quarantine (also used by tests).
    pub fn force_quarantine(&self, lp: &str) {
        let until = now_ms() + self.quarantine_cooldown_ms;
        let mut records = self.records.write();
        let record = records
            .entry(lp.to_string())
            .or_insert_with(HealthRecord::new);
        record.quarantined_until_ms = Some(until);
    }

    /// Update the session-layer connection state for an LP.
    pub fn set_session_status(&self, lp: &str, status: SessionStatus) {
        let mut records = self.records.write();
        let record = records
            .entry(lp.to_string())
            .or_insert_with(HealthRecord::new);
        record.session = status;
    }

    /// Score ∈ [0,1]; unknown LPs start optimistic at 1.0.
    pub fn score(&self, lp: &str) -> f64 {
        self.records
            .read()
            .get(lp)
            .map(|r| self.compute_score(r))
            .unwrap_or(1.0)
    }

    /// Latency EWMA used by the SOR tie-break.
    pub fn latency_ewma(&self, lp: &str) -> f64 {
        self.records.read().get(lp).map(|r| r.latency_ms).unwrap_or(0.0)
    }

    /// Quarantine check with lazy lifting: the cooldown must have elapsed and
    /// the score must have recovered to the degraded threshold.
    pub fn is_quarantined(&self, lp: &str) -> bool {
        let mut records = self.records.write();
        let Some(record) = records.get_mut(lp) else {
            return false;
        };
        let Some(until) = record.quarantined_until_ms else {
            return false;
        };
        if now_ms() < until {
            return true;
        }
        if self.compute_score(record) >= self.degraded_threshold {
            record.quarantined_until_ms = None;
            record.consecutive_rejects = 0;
            info!(lp = %lp, "quarantine lifted");
            false
        } else {
            true
        }
    }

    /// May this LP's quotes enter the aggregated book?
    pub fn quote_eligible(&self, lp: &str) -> bool {
        !self.is_quarantined(lp)
    }

    /// May the SOR send orders to this LP?
    pub fn order_eligible(&self, lp: &str) -> bool {
        if self.is_quarantined(lp) {
            return false;
        }
        self.records
            .read()
            .get(lp)
            .map(|r| r.session.is_logged_on())
            .unwrap_or(false)
    }

    /// Effective connection state for display.
    pub fn connection_state(&self, lp: &str) -> LpConnectionState {
        if self.is_quarantined(lp) {
            return LpConnectionState::Quarantined;
        }
        let records = self.records.read();
        let Some(record) = records.get(lp) else {
            return LpConnectionState::Disconnected;
        };
        match record.session {
            SessionStatus::Disconnected => LpConnectionState::Disconnected,
            SessionStatus::Connecting | SessionStatus::LogonSent => {
                LpConnectionState::Connecting
            }
            SessionStatus::LoggedOn
            | SessionStatus::ResendPending
            | SessionStatus::LogoutSent => {
                if self.compute_score(record) < self.degraded_threshold {
                    LpConnectionState::Degraded
                } else {
                    LpConnectionState::LoggedOn
                }
            }
        }
    }

    /// Dashboard snapshot for every registered LP.
    pub fn snapshot(&self) -> Vec<LpHealthSnapshot> {
        let lps: Vec<String> = self.records.read().keys().cloned().collect();
        let mut out = Vec::with_capacity(lps.len());
        for lp in lps {
            let state = self.connection_state(&lp);
            let records = self.records.read();
            if let Some(record) = records.get(&lp) {
                out.push(LpHealthSnapshot {
                    lp: lp.clone(),
                    state,
                    score: self.compute_score(record),
                    fill_rate: record.fill_rate,
                    slippage_pips: record.slippage_pips,
                    latency_ms: record.latency_ms,
                    reject_rate: record.reject_rate,
                    samples: record.samples,
                    consecutive_rejects: record.consecutive_rejects,
                    quarantined_until_ms: record.quarantined_until_ms,
                });
            }
        }
        out.sort_by(|a, b| a.lp.cmp(&b.lp));
        out
    }

    fn compute_score(&self, record: &HealthRecord) -> f64 {
        if record.samples == 0 {
            return 1.0;
        }
        let slippage_norm = (record.slippage_pips / self.slippage_cap_pips).clamp(0.0, 1.0);
        let latency_norm = (record.latency_ms / self.latency_cap_ms).clamp(0.0, 1.0);
        let [w_fill, w_slip, w_lat, w_rej] = self.weights;
        let score = w_fill * record.fill_rate
            + w_slip * (1.0 - slippage_norm)
            + w_lat * (1.0 - latency_norm)
            + w_rej * (1.0 - record.reject_rate);
        score.clamp(0.0, 1.0)
    }
}

impl std::fmt::Debug for LpHealthTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LpHealthTracker")
            .field("lps", &self.records.read().len())
            .field("alpha", &self.alpha)
            .field("weights", &self.weights)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> LpHealthTracker {
        LpHealthTracker::new(&SorConfig::default(), 0.5)
    }

    #[test]
    fn perfect_fills_score_high() {
        let t = tracker();
        t.register("X");
        for _ in 0..10 {
            t.record_sample("X", ExecutionSample::fill(0.0, 50.0));
        }
        let score = t.score("X");
        assert!(score > 0.9, "score was {score}");
        assert!(!t.is_quarantined("X"));
    }

    #[test]
    fn unknown_lp_is_optimistic() {
        let t = tracker();
        assert_eq!(t.score("unseen"), 1.0);
        assert!(!t.is_quarantined("unseen"));
    }

    #[test]
    fn rejects_degrade_then_quarantine() {
        let t = tracker();
        t.register("X");
        // With α=0.5, a few rejects crater fill rate and spike reject rate.
        t.record_sample("X", ExecutionSample::reject());
        t.record_sample("X", ExecutionSample::reject());
        t.record_sample("X", ExecutionSample::reject());
        // Score ≤ 0.3 and three consecutive rejects inside the window.
        assert!(t.is_quarantined("X"));
        assert!(!t.order_eligible("X"));
        assert!(!t.quote_eligible("X"));
    }

    #[test]
    fn three_consecutive_rejects_quarantine_even_with_good_score() {
        // Tiny alpha keeps the score high; the streak rule must still trip.
        let t = LpHealthTracker::new(&SorConfig::default(), 0.001);
        t.register("X");
        for _ in 0..100 {
            t.record_sample("X", ExecutionSample::fill(0.0, 10.0));
        }
        t.record_sample("X", ExecutionSample::reject());
        t.record_sample("X", ExecutionSample::reject());
        assert!(!t.is_quarantined("X"), "two rejects are not enough");
        t.record_sample("X", ExecutionSample::reject());
        assert!(t.is_quarantined("X"));
    }

    #[test]
    fn fill_resets_reject_streak() {
        let t = LpHealthTracker::new(&SorConfig::default(), 0.001);
        t.register("X");
        for _ in 0..100 {
            t.record_sample("X", ExecutionSample::fill(0.0, 10.0));
        }
        t.record_sample("X", ExecutionSample::reject());
        t.record_sample("X", ExecutionSample::reject());
        t.record_sample("X", ExecutionSample::fill(0.0, 10.0));
        t.record_sample("X", ExecutionSample::reject());
        assert!(!t.is_quarantined("X"));
    }

    #[test]
    fn score_is_deterministic_replay() {
        let samples = vec![
            ExecutionSample::fill(1.0, 120.0),
            ExecutionSample::reject(),
            ExecutionSample::fill(3.0, 300.0),
            ExecutionSample::fill(0.5, 80.0),
        ];
        let a = tracker();
        let b = tracker();
        for s in &samples {
            a.record_sample("X", *s);
            b.record_sample("X", *s);
        }
        assert_eq!(a.score("X"), b.score("X"));
    }

    #[test]
    fn order_eligibility_requires_logon() {
        let t = tracker();
        t.register("X");
        assert!(!t.order_eligible("X"), "disconnected LP not eligible");
        t.set_session_status("X", SessionStatus::LoggedOn);
        assert!(t.order_eligible("X"));
    }

    #[test]
    fn slippage_and_latency_are_capped_in_score() {
        let t = tracker();
        t.register("X");
        // Absurd slippage/latency saturate their terms instead of going
        // negative: floor contribution is fill_rate weight only.
        t.record_sample("X", ExecutionSample::fill(10_000.0, 1e9));
        let score = t.score("X");
        assert!((score - 0.5).abs() < 1e-9, "score was {score}");
    }

    #[test]
    fn connection_state_overlay() {
        let t = tracker();
        t.register("X");
        assert_eq!(t.connection_state("X"), LpConnectionState::Disconnected);
        t.set_session_status("X", SessionStatus::LoggedOn);
        assert_eq!(t.connection_state("X"), LpConnectionState::LoggedOn);
        t.force_quarantine("X");
        assert_eq!(t.connection_state("X"), LpConnectionState::Quarantined);
    }
}

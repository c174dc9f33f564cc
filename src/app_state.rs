// =============================================================================
// Central Application State — Meridian Execution Engine
// =============================================================================
//
// Ties the explicitly-constructed subsystems together for the API surface.
// Nothing here reaches for ambient state: every collaborator is built in
// main() and wired in once. The engines publish onto the event bus; AppState
// only aggregates read views (snapshots) for the REST dashboard and keeps the
// small operational alert log.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::events::{EngineEvent, EventBus};
use crate::exec_quality::{ExecutionQualityRecorder, LpQualityAggregate};
use crate::execution::ExecutionEngine;
use crate::fix::session::FixSessionHandle;
use crate::lp_health::{LpHealthSnapshot, LpHealthTracker};
use crate::position_ledger::{Position, PositionLedger};
use crate::quotes::aggregator::{QuoteAggregator, TopOfBook};
use crate::risk_gate::{AccountRiskSnapshot, RiskGate};
use crate::runtime_config::RuntimeConfig;
use crate::types::{now_ms, now_rfc3339};

/// Maximum number of recent alerts to retain.
const MAX_RECENT_ALERTS: usize = 100;

/// An operational alert for the dashboard log.
#[derive(Debug, Clone, Serialize)]
pub struct AlertRecord {
    pub message: String,
    pub at: String,
}

/// Central application state shared across all async tasks via `Arc`.
pub struct AppState {
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,
    pub events: EventBus,
    pub aggregator: Arc<QuoteAggregator>,
    pub health: Arc<LpHealthTracker>,
    pub ledger: Arc<PositionLedger>,
    pub quality: Arc<ExecutionQualityRecorder>,
    pub risk: Arc<RiskGate>,
    pub execution: Arc<ExecutionEngine>,
    pub sessions: RwLock<Vec<FixSessionHandle>>,

    /// Monotonically increasing version counter, bumped on engine events.
    pub state_version: AtomicU64,
    pub recent_alerts: RwLock<Vec<AlertRecord>>,
    pub start_time: std::time::Instant,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runtime_config: Arc<RwLock<RuntimeConfig>>,
        events: EventBus,
        aggregator: Arc<QuoteAggregator>,
        health: Arc<LpHealthTracker>,
        ledger: Arc<PositionLedger>,
        quality: Arc<ExecutionQualityRecorder>,
        risk: Arc<RiskGate>,
        execution: Arc<ExecutionEngine>,
    ) -> Self {
        Self {
            runtime_config,
            events,
            aggregator,
            health,
            ledger,
            quality,
            risk,
            execution,
            sessions: RwLock::new(Vec::new()),
            state_version: AtomicU64::new(1),
            recent_alerts: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    /// Record an operational alert (ring buffer).
    pub fn push_alert(&self, message: String) {
        let mut alerts = self.recent_alerts.write();
        alerts.push(AlertRecord {
            message,
            at: now_rfc3339(),
        });
        while alerts.len() > MAX_RECENT_ALERTS {
            alerts.remove(0);
        }
        self.increment_version();
    }

    /// Collector task: mirrors engine events into the version counter and
    /// the alert log so the dashboard sees both.
    pub async fn run_event_collector(self: Arc<Self>) {
        let mut rx = self.events.subscribe();
        loop {
            match rx.recv().await {
                Ok(EngineEvent::Alert { message, .. }) => self.push_alert(message),
                Ok(_) => {
                    self.increment_version();
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// Build the full dashboard snapshot.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let sessions = self
            .sessions
            .read()
            .iter()
            .map(|s| SessionStatusSnapshot {
                lp: s.lp_id.clone(),
                status: s.status().to_string(),
            })
            .collect();

        let mut quotes = HashMap::new();
        for symbol in self.aggregator.symbols() {
            quotes.insert(symbol.clone(), self.aggregator.top_of_book(&symbol));
        }

        let mut positions = Vec::new();
        for account_id in self.ledger.account_ids() {
            positions.extend(self.ledger.open_positions(&account_id));
        }

        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: now_ms(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            global_kill: self.risk.global_kill(),
            sessions,
            lp_health: self.health.snapshot(),
            quotes,
            positions,
            accounts: self.risk.snapshot(),
            execution_quality: self.quality.aggregates(),
            recent_alerts: self.recent_alerts.read().clone(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("state_version", &self.current_state_version())
            .field("sessions", &self.sessions.read().len())
            .finish()
    }
}

// =============================================================================
// Serializable snapshot types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatusSnapshot {
    pub lp: String,
    pub status: String,
}

/// Full engine state snapshot for `GET /api/v1/state`.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub global_kill: bool,
    pub sessions: Vec<SessionStatusSnapshot>,
    pub lp_health: Vec<LpHealthSnapshot>,
    pub quotes: HashMap<String, TopOfBook>,
    pub positions: Vec<Position>,
    pub accounts: Vec<AccountRiskSnapshot>,
    pub execution_quality: Vec<LpQualityAggregate>,
    pub recent_alerts: Vec<AlertRecord>,
}

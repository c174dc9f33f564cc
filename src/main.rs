// =============================================================================
// Meridian Execution Engine — Main Entry Point
// =============================================================================
//
// Construction happens here, once: config → event bus → health tracker →
// aggregator → ledger → risk gate → SOR → execution engine → API. The
// engines never reach for ambient state; every collaborator is passed in.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod errors;
mod events;
mod exec_quality;
mod execution;
mod fix;
mod lp_health;
mod position_ledger;
mod quotes;
mod risk_gate;
mod routing;
mod runtime_config;
mod sor;
mod types;

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::events::{EngineEvent, EventBus};
use crate::exec_quality::ExecutionQualityRecorder;
use crate::execution::ExecutionEngine;
use crate::fix::store::SessionStore;
use crate::lp_health::LpHealthTracker;
use crate::position_ledger::PositionLedger;
use crate::quotes::aggregator::QuoteAggregator;
use crate::risk_gate::RiskGate;
use crate::runtime_config::RuntimeConfig;
use crate::sor::SmartOrderRouter;

const CONFIG_PATH: &str = "meridian_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Meridian execution engine starting up");

    let config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config — using defaults");
        RuntimeConfig::default()
    });
    let alpha = config.ewma_alpha();
    let coalesce_interval_ms = config.sor.coalesce_interval_ms;
    let config = Arc::new(RwLock::new(config));

    // ── 2. Build the subsystems, leaves first ────────────────────────────
    let events = EventBus::new();
    let health = Arc::new(LpHealthTracker::new(&config.read().sor, alpha));
    let aggregator = Arc::new(QuoteAggregator::new(
        config.read().sor.stale_threshold_ms,
        health.clone(),
        events.clone(),
    ));
    let ledger = Arc::new(PositionLedger::new(
        config.read().engine.netting_mode,
        events.clone(),
    ));
    let risk = Arc::new(RiskGate::new(
        config.clone(),
        ledger.clone(),
        aggregator.clone(),
    ));
    let quality = Arc::new(ExecutionQualityRecorder::new(health.clone()));
    let sor = Arc::new(SmartOrderRouter::new(
        aggregator.clone(),
        health.clone(),
        config.clone(),
    ));
    let execution = Arc::new(ExecutionEngine::new(
        config.clone(),
        risk.clone(),
        ledger.clone(),
        quality.clone(),
        sor,
        events.clone(),
    ));
    execution.bbook.attach_aggregator(aggregator.clone());

    // Pre-register configured accounts and LPs.
    for account in &config.read().accounts {
        ledger.register_account(&account.account_id, account.starting_balance);
    }
    for lp in &config.read().lps {
        health.register(&lp.id);
    }

    let state = Arc::new(AppState::new(
        config.clone(),
        events.clone(),
        aggregator.clone(),
        health.clone(),
        ledger.clone(),
        quality,
        risk.clone(),
        execution.clone(),
    ));

    // ── 3. FIX sessions ──────────────────────────────────────────────────
    let (md_tx, mut md_rx) = mpsc::channel(1024);
    let (exec_tx, mut exec_rx) = mpsc::channel(1024);

    let sessions_config = config.read().fix_sessions.clone();
    let enabled_lps: Vec<String> = config
        .read()
        .lps
        .iter()
        .filter(|lp| lp.enabled)
        .map(|lp| lp.id.clone())
        .collect();

    for session_cfg in sessions_config {
        if !enabled_lps.iter().any(|id| id == &session_cfg.id) {
            info!(session = %session_cfg.id, "LP disabled — session not started");
            continue;
        }
        let store = Arc::new(SessionStore::open(
            Path::new(&session_cfg.store_path),
            &session_cfg.id,
        )?);
        let handle = fix::session::spawn(
            session_cfg.clone(),
            store,
            md_tx.clone(),
            exec_tx.clone(),
        );

        // Mirror session status into the health tracker.
        let mut status_rx = handle.subscribe_status();
        let lp_id = handle.lp_id.clone();
        let watcher_health = health.clone();
        tokio::spawn(async move {
            loop {
                watcher_health.set_session_status(&lp_id, *status_rx.borrow());
                if status_rx.changed().await.is_err() {
                    return;
                }
            }
        });

        execution.register_session(handle.clone());
        state.sessions.write().push(handle);
    }
    info!(count = state.sessions.read().len(), "FIX sessions launched");

    // ── 4. Inbound FIX traffic consumers ─────────────────────────────────
    // Market data: wire order per session is preserved by the channel.
    let md_aggregator = aggregator.clone();
    tokio::spawn(async move {
        while let Some((lp, msg)) = md_rx.recv().await {
            md_aggregator.apply_fix_market_data(&lp, &msg);
        }
    });

    // Execution reports: a single consumer keeps per-order application
    // serialized in wire order.
    let exec_engine = execution.clone();
    tokio::spawn(async move {
        while let Some((lp, msg)) = exec_rx.recv().await {
            exec_engine.on_app_message(&lp, &msg).await;
        }
    });

    // ── 5. Non-FIX quote feeds ───────────────────────────────────────────
    for feed in config.read().ws_feeds.clone() {
        if !feed.enabled {
            continue;
        }
        let feed_aggregator = aggregator.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = quotes::ws_feed::run_quote_feed(&feed, &feed_aggregator).await
                {
                    error!(lp = %feed.lp_id, error = %e, "quote feed error — reconnecting in 5s");
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });
    }

    // ── 6. Aggregated-quote fan-out and consumers ────────────────────────
    tokio::spawn(aggregator.clone().run_fanout(coalesce_interval_ms));

    // Mark-to-market + circuit-breaker observation on every published book.
    let mark_ledger = ledger.clone();
    let mark_risk = risk.clone();
    let mark_events = events.clone();
    tokio::spawn(async move {
        let mut rx = mark_events.subscribe();
        loop {
            match rx.recv().await {
                Ok(EngineEvent::AggregatedQuote { symbol, book }) => {
                    if let (Some(bid), Some(ask)) = (&book.bid, &book.ask) {
                        mark_ledger.mark(&symbol, bid.price, ask.price);
                    }
                    if let Some(mid) = book.mid() {
                        mark_risk.observe_price(&symbol, mid);
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    // B-book trigger dispatcher (one serialized evaluation task per symbol).
    tokio::spawn(execution.bbook.clone().run_dispatcher());

    // Dashboard event collector (alerts + version bumps).
    tokio::spawn(state.clone().run_event_collector());

    // ── 7. API server ────────────────────────────────────────────────────
    let bind_addr =
        std::env::var("MERIDIAN_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let api_state = state.clone();
    let api_addr = bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&api_addr)
            .await
            .expect("failed to bind API server");
        info!(addr = %api_addr, "API server listening");
        axum::serve(listener, app).await.expect("API server failed");
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping");

    if let Err(e) = config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("Meridian execution engine shut down complete.");
    Ok(())
}

// =============================================================================
// WebSocket Handler — push feed of engine events
// =============================================================================
//
// Clients connect to `/api/v1/ws?token=<token>[&account_id=<id>]` and receive
// the engine event stream as JSON:
//   - order updates and position updates, tagged with their account id,
//   - aggregated quotes (broadcast to every subscriber),
//   - operational alerts.
//
// When `account_id` is given, order and position events for other accounts
// are filtered out. Ping frames are answered with Pong; a subscriber that
// falls behind the broadcast ring resumes from the oldest retained event and
// is told how many it missed.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::app_state::AppState;
use crate::events::EngineEvent;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
    #[serde(default)]
    account_id: Option<String>,
}

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if !validate_token(&token) {
        warn!("WebSocket connection rejected: invalid token");
        return (
            axum::http::StatusCode::FORBIDDEN,
            "Invalid or missing token",
        )
            .into_response();
    }

    info!(account_filter = ?query.account_id, "WebSocket connection accepted");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, query.account_id))
        .into_response()
}

/// Pump engine events to one client until it disconnects.
async fn handle_ws_connection(
    socket: WebSocket,
    state: Arc<AppState>,
    account_filter: Option<String>,
) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.events.subscribe();

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if !passes_filter(&event, account_filter.as_deref()) {
                            continue;
                        }
                        match serde_json::to_string(&event) {
                            Ok(json) => {
                                if sender.send(Message::Text(json.into())).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "failed to serialize engine event");
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        let note = serde_json::json!({
                            "type": "lagged",
                            "missed": missed,
                        });
                        if sender.send(Message::Text(note.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }

            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket closed by client");
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        // Client heartbeats are accepted and ignored.
                        debug!(msg = %text, "WebSocket text message received");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error");
                        break;
                    }
                }
            }
        }
    }

    info!("WebSocket connection closed");
}

/// Account-scoped events only reach their own account's subscribers.
fn passes_filter(event: &EngineEvent, account_filter: Option<&str>) -> bool {
    match (event.account_id(), account_filter) {
        (Some(event_account), Some(filter)) => event_account == filter,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EngineEvent;
    use crate::types::{now_rfc3339, Order, OrderStatus};

    fn order_event(account: &str) -> EngineEvent {
        EngineEvent::OrderUpdate {
            account_id: account.to_string(),
            order: Order {
                id: "o1".into(),
                account_id: account.to_string(),
                symbol: "EURUSD".into(),
                side: crate::types::Side::Buy,
                order_type: crate::types::OrderType::Market,
                requested_volume: 1.0,
                remaining_volume: 1.0,
                requested_price: None,
                trigger_price: None,
                time_in_force: Default::default(),
                stop_loss: None,
                take_profit: None,
                routing: crate::types::BookKind::B,
                target_lp: None,
                hedge_percent: None,
                cl_ord_id: None,
                closing_position_id: None,
                status: OrderStatus::New,
                created_at: now_rfc3339(),
                sent_at_ms: None,
                last_update_at: now_rfc3339(),
                filled_volume: 0.0,
                avg_fill_price: 0.0,
                partial_fill_count: 0,
                last_reject_reason: None,
            },
        }
    }

    #[test]
    fn account_filter_scopes_order_events() {
        let event = order_event("acc-1");
        assert!(passes_filter(&event, None));
        assert!(passes_filter(&event, Some("acc-1")));
        assert!(!passes_filter(&event, Some("acc-2")));
    }

    #[test]
    fn quotes_and_alerts_reach_everyone() {
        let alert = EngineEvent::alert("heads up");
        assert!(passes_filter(&alert, Some("acc-1")));
        assert!(passes_filter(&alert, None));
    }
}

// =============================================================================
// Engine Event Bus — push stream of order / position / quote updates
// =============================================================================
//
// The execution engines and the quote aggregator publish here; subscribers
// (WebSocket push, recorders) compose on top without any back-reference into
// the engines. Events that relate to an account carry its id so the push
// surface can route them.
//
// Built on tokio's broadcast channel: publishing never blocks, and a slow
// subscriber only loses its own backlog (RecvError::Lagged), never anyone
// else's.
// =============================================================================

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::position_ledger::Position;
use crate::quotes::aggregator::TopOfBook;
use crate::types::{now_rfc3339, Order};

/// Capacity of the broadcast ring. Subscribers that fall further behind than
/// this observe a `Lagged` error and resume from the oldest retained event.
const EVENT_BUS_CAPACITY: usize = 4096;

/// One event on the engine's outbound stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    OrderUpdate {
        account_id: String,
        order: Order,
    },
    PositionUpdate {
        account_id: String,
        position: Position,
    },
    AggregatedQuote {
        symbol: String,
        book: TopOfBook,
    },
    /// Operational alert (unsolicited ExecutionReport, timeout recovery, ...).
    Alert {
        message: String,
        at: String,
    },
}

impl EngineEvent {
    /// Account this event belongs to, if any. Quote events are broadcast to
    /// every subscriber.
    pub fn account_id(&self) -> Option<&str> {
        match self {
            Self::OrderUpdate { account_id, .. }
            | Self::PositionUpdate { account_id, .. } => Some(account_id),
            Self::AggregatedQuote { .. } | Self::Alert { .. } => None,
        }
    }

    pub fn alert(message: impl Into<String>) -> Self {
        Self::Alert {
            message: message.into(),
            at: now_rfc3339(),
        }
    }
}

/// Cloneable handle to the engine's event stream.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event. A send with no live subscribers is not an error.
    pub fn publish(&self, event: EngineEvent) {
        if let Err(e) = self.tx.send(event) {
            // Only fails when nobody is subscribed; the event is simply dropped.
            debug!(error = %e, "event published with no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(EngineEvent::alert("session LP1 reconnecting"));

        match rx.recv().await.unwrap() {
            EngineEvent::Alert { message, .. } => {
                assert!(message.contains("LP1"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        // Must not panic or error.
        bus.publish(EngineEvent::alert("nobody listening"));
    }

    #[test]
    fn account_routing_tag() {
        let alert = EngineEvent::alert("x");
        assert_eq!(alert.account_id(), None);
    }
}

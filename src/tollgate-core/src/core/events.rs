use crate::models::events::RouteEvent;
use tokio::sync::broadcast;
use tracing::debug;

/// Publishes committed route events.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, events: &[RouteEvent]);
}

/// In-process event bus; subscribers that fall behind lose the oldest events.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<RouteEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RouteEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, events: &[RouteEvent]) {
        for event in events {
            // no subscribers is not an error
            let delivered = self.tx.send(event.clone()).unwrap_or(0);
            debug!(event = event.name(), route = %event.route_id, delivered, "route event published");
        }
    }
}

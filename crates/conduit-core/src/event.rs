use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;

use crate::error::Result;
use crate::traits::Notifier;
use crate::types::FlowEvent;

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events published while the bus is connected.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<FlowEvent>,
    connected: AtomicBool,
}

impl EventBus {
    /// Create a connected bus.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self {
            tx,
            connected: AtomicBool::new(true),
        }
    }

    pub fn publish(&self, event: FlowEvent) {
        if !self.is_connected() {
            return;
        }
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<FlowEvent> {
        self.tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Notifier for EventBus {
    fn connect(&self) -> BoxFuture<'_, Result<()>> {
        self.connected.store(true, Ordering::Release);
        Box::pin(async { Ok(()) })
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<()>> {
        self.connected.store(false, Ordering::Release);
        Box::pin(async { Ok(()) })
    }

    fn notify(&self, event: FlowEvent) {
        self.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExecutionId;

    fn broadcast(topic: &str) -> FlowEvent {
        FlowEvent::Broadcast {
            execution_id: ExecutionId::from_string("run"),
            topic: topic.into(),
            payload: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.notify(broadcast("handoff"));
        match rx.recv().await.unwrap() {
            FlowEvent::Broadcast { topic, .. } => assert_eq!(topic, "handoff"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn disconnected_bus_drops_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.disconnect().await.unwrap();
        bus.notify(broadcast("dropped"));
        bus.connect().await.unwrap();
        bus.notify(broadcast("kept"));
        match rx.recv().await.unwrap() {
            FlowEvent::Broadcast { topic, .. } => assert_eq!(topic, "kept"),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}

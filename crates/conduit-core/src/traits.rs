use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::flow::Flow;
use crate::types::*;

/// AI completion / routing service.
pub trait AiService: Send + Sync + 'static {
    /// Run a completion for the given messages and tier hint.
    fn complete(&self, request: AiRequest) -> BoxFuture<'_, Result<AiResponse>>;
}

/// Messaging send service for one channel (whatsapp, telegram, email, ...).
pub trait MessageSender: Send + Sync + 'static {
    /// Channel name this sender is registered under.
    fn channel(&self) -> &str;

    fn send(&self, message: OutboundMessage) -> BoxFuture<'_, Result<DeliveryReceipt>>;
}

/// Flow definition persistence, consumed read-only by the engine.
pub trait FlowStore: Send + Sync + 'static {
    fn load(&self, flow_id: &str) -> BoxFuture<'_, Result<Arc<Flow>>>;
}

/// Out-of-band event emission with an explicit lifecycle.
pub trait Notifier: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'_, Result<()>>;

    fn disconnect(&self) -> BoxFuture<'_, Result<()>>;

    /// Emit an event. Fire-and-forget: delivery failures are not surfaced.
    fn notify(&self, event: FlowEvent);
}

/// Circuit breaker consulted by retry wrappers.
pub trait CircuitBreaker: Send + Sync + 'static {
    /// Whether calls guarded by `key` may proceed.
    fn can_execute(&self, key: &str) -> bool;

    fn record_success(&self, key: &str);

    fn record_failure(&self, key: &str);
}

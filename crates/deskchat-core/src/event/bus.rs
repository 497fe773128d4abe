//! Broadcast event bus for distributing `ChatEvent` to multiple subscribers.
//!
//! Built on `tokio::sync::broadcast`. The coordinator and the post queue
//! publish into the same bus; views, loggers, and tests subscribe. Publishing
//! with no active subscribers is a no-op.

use deskchat_types::event::ChatEvent;
use tokio::sync::broadcast;

/// Multi-consumer bus for session lifecycle and delivery-status events.
///
/// Cloning the bus clones the sender, so every clone publishes into the
/// same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ChatEvent>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no subscribers, the event is silently dropped.
    pub fn publish(&self, event: ChatEvent) {
        let _ = self.sender.send(event);
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

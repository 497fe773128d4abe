//! UI boundary of the coordinator.

use deskchat_types::event::ChatEvent;

/// A UI collaborator bound to one conversation.
///
/// Receives the conversation's lifecycle and delivery events while attached.
/// Called from the coordinator's task, so implementations must not block.
pub trait ChatView: Send + Sync + 'static {
    fn on_event(&self, event: &ChatEvent);
}

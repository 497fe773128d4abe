//! Event types for the deskchat event bus.
//!
//! `ChatEvent` is the single notification type emitted by the session
//! coordinator and the post queue. All variants are Clone + Send + Sync for
//! use with tokio broadcast channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chat::SessionState;
use crate::job::JobId;

/// Notifications about session lifecycle and message delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// The coordinator moved between lifecycle states.
    SessionStateChanged {
        conversation: String,
        from: SessionState,
        to: SessionState,
    },

    /// Guest creation and session start both succeeded.
    SessionEstablished {
        conversation: String,
        session_id: String,
        case_link_id: String,
    },

    /// Session establishment failed; the coordinator is back in `Idle`.
    SessionFailed { conversation: String, error: String },

    /// A message was durably recorded.
    MessageQueued { job_id: JobId, deferred: bool },

    /// A delivery attempt failed transiently and will be retried.
    MessageRetrying {
        job_id: JobId,
        attempt: u32,
        next_attempt_at: DateTime<Utc>,
        error: String,
    },

    /// The remote acknowledged the message.
    MessageDelivered { job_id: JobId, attempts: u32 },

    /// The message reached terminal failure and will not be retried.
    MessageFailed { job_id: JobId, error: String },

    /// The coordinator finished teardown.
    CoordinatorDestroyed { conversation: String },
}

impl ChatEvent {
    /// The job this event refers to, for delivery-status events.
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            ChatEvent::MessageQueued { job_id, .. }
            | ChatEvent::MessageRetrying { job_id, .. }
            | ChatEvent::MessageDelivered { job_id, .. }
            | ChatEvent::MessageFailed { job_id, .. } => Some(job_id),
            _ => None,
        }
    }

    /// The conversation (lane) this event belongs to.
    pub fn conversation(&self) -> &str {
        match self {
            ChatEvent::SessionStateChanged { conversation, .. }
            | ChatEvent::SessionEstablished { conversation, .. }
            | ChatEvent::SessionFailed { conversation, .. }
            | ChatEvent::CoordinatorDestroyed { conversation } => conversation,
            ChatEvent::MessageQueued { job_id, .. }
            | ChatEvent::MessageRetrying { job_id, .. }
            | ChatEvent::MessageDelivered { job_id, .. }
            | ChatEvent::MessageFailed { job_id, .. } => &job_id.lane,
        }
    }
}

//! Guest identity, chat session, and session lifecycle types.
//!
//! These model one live support conversation: the anonymous guest issued by
//! the backend, the session linking that guest to a support case, and the
//! coordinator's lifecycle state.

use serde::{Deserialize, Serialize};

use std::fmt;

/// Backend-issued identity for an anonymous visitor, valid for one conversation.
///
/// The `token` authenticates every follow-up call made on behalf of the guest.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestIdentity {
    pub id: String,
    pub token: String,
}

impl GuestIdentity {
    pub fn new(id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            token: token.into(),
        }
    }
}

impl fmt::Debug for GuestIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestIdentity")
            .field("id", &self.id)
            .field("token", &"[redacted]")
            .finish()
    }
}

/// A backend-tracked conversation linking a guest to a support case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    /// Identifier of the support case this session was opened against.
    pub case_link_id: String,
}

impl ChatSession {
    pub fn new(id: impl Into<String>, case_link_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            case_link_id: case_link_id.into(),
        }
    }
}

/// Lifecycle state of a session coordinator.
///
/// ```text
/// Idle -> CreatingGuest -> StartingSession -> Active -> Ending -> Ended
///              |                  |
///              +------> Idle <----+   (establishment failure)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    CreatingGuest,
    StartingSession,
    Active,
    Ending,
    Ended,
}

impl SessionState {
    /// `Ended` is terminal; a coordinator is never reused afterwards.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Ended)
    }
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::Idle
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::CreatingGuest => "creating_guest",
            SessionState::StartingSession => "starting_session",
            SessionState::Active => "active",
            SessionState::Ending => "ending",
            SessionState::Ended => "ended",
        };
        f.write_str(s)
    }
}

/// Ephemeral presence signal relayed while a session is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypingSignal {
    Started,
    Stopped,
}

impl fmt::Display for TypingSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypingSignal::Started => write!(f, "started"),
            TypingSignal::Stopped => write!(f, "stopped"),
        }
    }
}

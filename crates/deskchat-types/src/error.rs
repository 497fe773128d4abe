use thiserror::Error;

use crate::job::JobId;

/// Failure of a call to the remote chat service.
///
/// The transport decides which variant applies; timeouts count as transient.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Network failure or service unavailable. Safe to retry.
    #[error("transient network error: {0}")]
    Transient(String),

    /// The remote refused the request (invalid payload, expired session).
    #[error("rejected by remote service: {0}")]
    Rejected(String),
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}

/// Why establishing a chat session failed.
///
/// Reported once per `start_session` attempt; never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("guest creation failed: {0}")]
    GuestCreation(RemoteError),

    #[error("session start failed: {0}")]
    SessionStart(RemoteError),

    #[error("no conversation token available")]
    MissingConversationToken,
}

/// Errors from repository operations (used by trait definitions in deskchat-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors surfaced by the durable post queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// A job with this identity was already recorded.
    #[error("duplicate job id: {0}")]
    Duplicate(JobId),

    #[error("job not found: {0}")]
    NotFound(JobId),

    /// The queue has been shut down.
    #[error("post queue is shut down")]
    Closed,
}

//! RemoteChatService trait definition.
//!
//! The backend capability set the coordinator and the queue talk to. The wire
//! client is supplied by the host application; this crate only depends on the
//! trait. Uses native async fn in traits (RPITIT, Rust 2024 edition).

use deskchat_types::chat::{ChatSession, GuestIdentity, TypingSignal};
use deskchat_types::error::RemoteError;
use deskchat_types::job::JobId;

/// A message ready to be posted on behalf of a guest.
#[derive(Debug, Clone, Copy)]
pub struct OutboundMessage<'a> {
    /// Stable identity of the job, for transports that forward an
    /// idempotency key.
    pub client_id: &'a JobId,
    pub body: &'a str,
    pub guest_id: &'a str,
    pub guest_token: &'a str,
    pub conversation_token: &'a str,
    pub case_link_id: &'a str,
}

/// Async operations exposed by the remote chat backend.
///
/// Every call resolves exactly once, failing with `RemoteError::Transient`
/// (retryable; timeouts included) or `RemoteError::Rejected` (terminal).
pub trait RemoteChatService: Send + Sync + 'static {
    /// Register an anonymous guest for one conversation.
    fn create_guest_customer(
        &self,
        display_name: &str,
        conversation_token: &str,
    ) -> impl std::future::Future<Output = Result<GuestIdentity, RemoteError>> + Send;

    /// Open a chat session for the guest, linked to a new support case.
    fn start_session(
        &self,
        guest: &GuestIdentity,
        conversation_token: &str,
    ) -> impl std::future::Future<Output = Result<ChatSession, RemoteError>> + Send;

    fn end_session(
        &self,
        guest: &GuestIdentity,
        session: &ChatSession,
        conversation_token: &str,
    ) -> impl std::future::Future<Output = Result<(), RemoteError>> + Send;

    fn signal_typing(
        &self,
        signal: TypingSignal,
        guest: &GuestIdentity,
        session: &ChatSession,
        conversation_token: &str,
    ) -> impl std::future::Future<Output = Result<(), RemoteError>> + Send;

    fn post_message(
        &self,
        message: &OutboundMessage<'_>,
    ) -> impl std::future::Future<Output = Result<(), RemoteError>> + Send;
}

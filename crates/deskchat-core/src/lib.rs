//! Session coordination and durable message delivery for deskchat.
//!
//! This crate defines the "ports" (traits) that the infrastructure layer and
//! the host application implement -- `RemoteChatService`, `IdentityProvider`,
//! `PostJobStore`, `ChatView` -- plus the two engines built on them: the
//! `SessionCoordinator` actor and the `PostQueue` dispatcher. It depends only
//! on `deskchat-types`, never on `deskchat-infra` or any database crate.

pub mod event;
pub mod identity;
pub mod queue;
pub mod remote;
pub mod session;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

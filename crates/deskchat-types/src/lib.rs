//! Shared domain types for deskchat.
//!
//! Guest identities, chat sessions, durable post jobs, events, configuration,
//! and the error taxonomy shared by the coordinator and the delivery queue.
//!
//! Zero infrastructure dependencies -- only serde, chrono, thiserror.

pub mod chat;
pub mod config;
pub mod error;
pub mod event;
pub mod job;

//! Durable post queue: storage seam, retry policy, and the lane dispatcher.

pub mod dispatcher;
pub mod memory;
pub mod retry;
pub mod store;

pub use dispatcher::PostQueue;
pub use memory::MemoryPostJobStore;
pub use retry::{RetryDecision, RetryPolicy};
pub use store::{LaneHead, PostJobStore};

//! SQLite storage layer.
//!
//! The durable post queue backed by SQLite with WAL mode and split
//! read/write connection pools.

pub mod pool;
pub mod post_job;

pub use pool::DatabasePool;
pub use post_job::SqlitePostJobStore;

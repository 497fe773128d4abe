//! Event distribution for session and delivery notifications.

pub mod bus;

pub use bus::EventBus;

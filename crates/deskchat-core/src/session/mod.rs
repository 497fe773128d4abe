//! Guest session lifecycle: the pure state machine and the actor that runs it.

pub mod coordinator;
pub mod state;
pub mod view;

pub use coordinator::SessionCoordinator;
pub use state::{Effect, SessionMachine};
pub use view::ChatView;

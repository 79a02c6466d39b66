//! Session lifecycle: state machine, registry and events.

pub mod events;
pub mod registry;
pub mod state;

pub use events::{event_names, SessionEvent};
pub use registry::{Session, SessionRegistry};
pub use state::{SessionState, SessionStateMachine, StateTransitionError};

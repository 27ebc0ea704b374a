//! WebSocket speaking-turn coordination server.

mod coordinator;
mod handler;
mod message;
mod runner;
mod signal;
mod state;

pub use coordinator::{Command, Coordinator, Rejection};
pub use message::{ClientCommand, JoinRequest, ServerEvent};
pub use runner::run_server;
pub use state::{ConnId, GateState, Participant, RegisterError, SessionState, OUTBOX_CAPACITY};

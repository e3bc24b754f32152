/**
 * session/mod.rs
 *
 * Server session subsystem: the connection state machine and the tick
 * loop driving it.
 */

mod machine;
mod state;

pub use machine::{SessionMachine, TICK_WAIT};
pub use state::SessionState;

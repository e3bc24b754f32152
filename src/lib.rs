#![allow(unused_doc_comments)]
/**
 * This style of comments threw out warnings.
 * This allow statement fixes that
 */

/**
 * lib.rs
 */

pub mod broker;
pub mod channel;
pub mod config;
pub mod events;
pub mod location;
pub mod protocol;
pub mod session;

pub use broker::LocationBroker;
pub use channel::{Channel, ChannelError, TcpChannel};
pub use config::ServerConfig;
pub use events::{EventSink, LocationResponse};
pub use location::{LocationCache, LocationFix};
pub use session::{SessionMachine, SessionState};

//! Network infrastructure: the TCP session with a Core.
//!
//! - `connection` owns the socket, the state machine, and the background
//!   receive and keep-alive tasks.
//! - `correlator` matches responses to waiting requests by id.
//! - `router` fans notifications out to subscribers.
//! - `keepalive` tracks idle time.

pub mod connection;
pub mod correlator;
pub mod keepalive;
pub mod router;

pub use connection::{Connection, ConnectionConfig, ConnectionEvent, ConnectionState};
pub use correlator::{Correlator, CorrelatorError, PendingResponse, Resolution};
pub use keepalive::KeepAlive;
pub use router::NotificationRouter;

//! qrc-client library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does qrc-client do? (for beginners)
//!
//! A Q-SYS *Core* is an audio/video/control processor.  It exposes the QRC
//! service on TCP port 1710: JSON-RPC 2.0 objects, each terminated by a
//! single NUL byte.  This crate:
//!
//! 1. Opens the TCP session and keeps it alive with `NoOp` requests while
//!    otherwise idle (the Core drops silent sessions after about a minute).
//! 2. Gives every request a unique id and hands each response to the caller
//!    that sent the matching request.
//! 3. Routes notifications pushed by the Core, such as `EngineStatus` and
//!    change-group auto-poll updates, to subscribers.
//! 4. Tracks the change groups created on the Core and refuses a fifth one
//!    before any request is sent.

/// Application layer: the high-level client.
pub mod application;

/// Infrastructure layer: TCP session and configuration.
pub mod infrastructure;

pub use application::client::{ChangeGroupUpdates, QrcClient, RpcChannel};
pub use infrastructure::network::{Connection, ConnectionConfig, ConnectionEvent, ConnectionState};

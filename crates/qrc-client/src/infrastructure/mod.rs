//! Infrastructure layer for the QRC client.
//!
//! **Dependency rule**: this layer may depend on `application` and `qrc_core`,
//! but MUST NOT be imported by the `application` layer.
//!
//! # Sub-modules
//!
//! - **`network`** – the TCP session: framing on the socket, request/response
//!   correlation, notification routing, and the `NoOp` keep-alive.  Implements
//!   the application's `RpcChannel` trait.
//!
//! - **`storage`** – TOML configuration: Core address, credentials, and
//!   session timing.

pub mod network;
pub mod storage;

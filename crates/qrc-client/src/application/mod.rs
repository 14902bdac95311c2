//! Application layer use cases for the QRC client.
//!
//! - **`client`** – `QrcClient`: login, status, and change-group management
//!   on top of any `RpcChannel`.  The real channel is the network
//!   `Connection`; unit tests substitute a mock.

pub mod client;

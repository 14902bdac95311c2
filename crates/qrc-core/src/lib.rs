//! # qrc-core
//!
//! Shared library for the QRC client containing the wire framer, the JSON-RPC
//! message envelopes, the request-id counter, the change-group domain model,
//! and the error taxonomy.
//!
//! It has zero dependencies on sockets or an async runtime, so everything in
//! here can be exercised with plain unit tests.
//!
//! # Architecture overview (for beginners)
//!
//! A Q-SYS Core is an audio/video processor that can be remote-controlled over
//! TCP port 1710 using QRC: JSON-RPC 2.0 objects, each terminated by a single
//! null byte (`0x00`).  A client sends requests (`Logon`, `StatusGet`,
//! `ChangeGroup.*`, `NoOp`) and the Core answers with responses carrying the
//! same `id`.  The Core may also push notifications (no `id`) at any time.
//!
//! This crate is the sans-IO foundation.  It defines:
//!
//! - **`protocol`** – How bytes travel over the network.  The framer splits
//!   the incoming byte stream at null bytes and serializes outgoing requests;
//!   the message types give each frame a typed shape.
//!
//! - **`domain`** – Client-side bookkeeping with no I/O.  The
//!   `ChangeGroupRegistry` tracks which change groups are live and enforces
//!   the device's limit of four.
//!
//! - **`error`** – `QrcError`, the structured error every public operation of
//!   the client returns, with an `ErrorKind` callers can branch on.

pub mod domain;
pub mod error;
pub mod protocol;

pub use domain::change_group::{
    ChangeGroup, ChangeGroupError, ChangeGroupRegistry, MAX_CHANGE_GROUPS,
};
pub use error::{ErrorKind, QrcError};
pub use protocol::framer::{decode_message, encode_frame, FrameDecoder, FrameError, ProtocolError};
pub use protocol::messages::{InboundMessage, Notification, Request, RequestId, Response, RpcError};

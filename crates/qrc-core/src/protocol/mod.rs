//! Protocol module containing message types, the null-byte framer, and the
//! request-id counter.

pub mod framer;
pub mod messages;
pub mod request_id;

pub use framer::{decode_message, encode_frame, FrameDecoder, FrameError, ProtocolError};
pub use messages::*;
pub use request_id::RequestIdCounter;

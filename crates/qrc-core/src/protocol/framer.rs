//! Null-byte framing for QRC messages.
//!
//! Wire format:
//! ```text
//! <UTF-8 JSON text>0x00<UTF-8 JSON text>0x00...
//! ```
//! There is no length prefix.  JSON text can never contain a raw `0x00`
//! (serializers escape it as `\u0000`), so the terminator is unambiguous.
//!
//! # Why a buffer is needed
//!
//! TCP is a stream protocol.  A single `read()` may return half a message, or
//! the tail of one message plus two more complete ones.  [`FrameDecoder`]
//! accumulates bytes and yields each complete frame as soon as its terminator
//! arrives, keeping the partial tail for the next read.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::protocol::messages::{InboundMessage, Notification, Response, RpcError};

/// Byte that terminates every frame, in both directions.
pub const FRAME_TERMINATOR: u8 = 0x00;

/// Largest frame accepted before the decoder gives up on it (16 MiB).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Errors affecting a single frame.  The stream itself stays usable.
#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    /// The bytes between two terminators are not valid UTF-8.
    #[error("frame is not valid UTF-8: {0}")]
    InvalidUtf8(String),

    /// A frame grew past the size limit before its terminator arrived.
    #[error("frame exceeds maximum length of {limit} bytes")]
    Oversized { limit: usize },
}

/// Errors that can occur turning frames into messages or messages into frames.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The message could not be serialized to JSON.
    #[error("failed to serialize message: {0}")]
    Serialize(String),

    /// The frame text is not valid JSON.
    #[error("malformed JSON in frame: {0}")]
    MalformedJson(String),

    /// The frame is valid JSON but not an object.
    #[error("frame is not a JSON object")]
    NotAnObject,

    /// The `id` member is not a non-negative integer.
    #[error("invalid response id: {0}")]
    InvalidId(String),

    /// A response carries both `result` and `error`.
    #[error("response {id} carries both result and error")]
    AmbiguousOutcome { id: u64 },

    /// A response carries neither `result` nor `error`.
    #[error("response {id} carries neither result nor error")]
    MissingOutcome { id: u64 },

    /// The object has neither an `id` nor a `method`.
    #[error("message is neither a response nor a notification")]
    UnrecognizedMessage,

    #[error(transparent)]
    Frame(#[from] FrameError),
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Serializes `message` to JSON and appends the frame terminator.
///
/// # Errors
///
/// Returns [`ProtocolError::Serialize`] if `message` cannot be represented as
/// JSON (for example a map with non-string keys).
///
/// # Examples
///
/// ```rust
/// use qrc_core::protocol::{encode_frame, Request};
/// use serde_json::json;
///
/// let bytes = encode_frame(&Request::new("NoOp", json!({}), 3)).unwrap();
/// assert_eq!(bytes.last(), Some(&0u8));
/// ```
pub fn encode_frame<T: Serialize + ?Sized>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut buf =
        serde_json::to_vec(message).map_err(|e| ProtocolError::Serialize(e.to_string()))?;
    buf.push(FRAME_TERMINATOR);
    Ok(buf)
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Accumulates stream bytes and splits them into frames.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_frame_len: usize,
    /// Set after an oversized partial frame; bytes are dropped up to the next
    /// terminator.
    discarding: bool,
    /// Leading bytes of `buffer` already searched without finding a
    /// terminator.  A frame arriving in many reads is scanned once overall.
    scanned: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_frame_len(MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(4096),
            max_frame_len,
            discarding: false,
            scanned: 0,
        }
    }

    /// Appends `chunk` to the buffer and returns an iterator over the complete
    /// frames now available.
    ///
    /// The iterator is lazy: frames left unconsumed when it is dropped stay in
    /// the buffer and are yielded by the next call (an empty `chunk` is fine).
    ///
    /// # Examples
    ///
    /// ```rust
    /// use qrc_core::protocol::FrameDecoder;
    ///
    /// let mut decoder = FrameDecoder::new();
    /// assert_eq!(decoder.feed(b"{\"a\"").count(), 0);
    /// let frames: Vec<_> = decoder.feed(b":1}\0").collect();
    /// assert_eq!(frames, vec![Ok("{\"a\":1}".to_string())]);
    /// ```
    pub fn feed(&mut self, chunk: &[u8]) -> Frames<'_> {
        self.buffer.extend_from_slice(chunk);
        Frames {
            decoder: self,
            cursor: 0,
        }
    }

    /// Number of buffered bytes not yet returned as a frame.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drops any buffered partial frame.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.discarding = false;
        self.scanned = 0;
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over the complete frames in a [`FrameDecoder`] buffer.
///
/// Consumed bytes are removed from the buffer when the iterator is dropped.
pub struct Frames<'a> {
    decoder: &'a mut FrameDecoder,
    cursor: usize,
}

impl Iterator for Frames<'_> {
    type Item = Result<String, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let search_from = self.cursor.max(self.decoder.scanned);
            let terminator = self.decoder.buffer[search_from..]
                .iter()
                .position(|&b| b == FRAME_TERMINATOR)
                .map(|i| search_from + i);

            let Some(end) = terminator else {
                self.decoder.scanned = self.decoder.buffer.len();
                let pending = self.decoder.buffer.len() - self.cursor;
                if self.decoder.discarding {
                    self.cursor = self.decoder.buffer.len();
                } else if pending > self.decoder.max_frame_len {
                    self.decoder.discarding = true;
                    self.cursor = self.decoder.buffer.len();
                    return Some(Err(FrameError::Oversized {
                        limit: self.decoder.max_frame_len,
                    }));
                }
                return None;
            };

            let start = self.cursor;
            let len = end - start;
            self.cursor = end + 1;

            if self.decoder.discarding {
                self.decoder.discarding = false;
                continue;
            }
            if len == 0 {
                // Consecutive terminators: nothing to yield.
                continue;
            }
            if len > self.decoder.max_frame_len {
                return Some(Err(FrameError::Oversized {
                    limit: self.decoder.max_frame_len,
                }));
            }

            let text = std::str::from_utf8(&self.decoder.buffer[start..end])
                .map(str::to_owned)
                .map_err(|e| FrameError::InvalidUtf8(e.to_string()));
            return Some(text);
        }
    }
}

impl Drop for Frames<'_> {
    fn drop(&mut self) {
        self.decoder.buffer.drain(..self.cursor);
        self.decoder.scanned = self.decoder.scanned.saturating_sub(self.cursor);
    }
}

/// Parses one frame into a response or a notification.
///
/// Classification:
/// - a non-null `id` together with `result` or `error` is a [`Response`];
/// - otherwise a string `method` is a [`Notification`];
/// - anything else is a [`ProtocolError`].
///
/// # Errors
///
/// Returns [`ProtocolError`] when the text is not JSON or the object does not
/// have a recognisable shape.  The error concerns this frame only.
///
/// # Examples
///
/// ```rust
/// use qrc_core::protocol::{decode_message, InboundMessage};
///
/// let msg = decode_message(r#"{"jsonrpc":"2.0","id":1,"result":{"Status":"OK"}}"#).unwrap();
/// assert!(matches!(msg, InboundMessage::Response(r) if r.id == 1));
/// ```
pub fn decode_message(text: &str) -> Result<InboundMessage, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::MalformedJson(e.to_string()))?;
    let Value::Object(mut object) = value else {
        return Err(ProtocolError::NotAnObject);
    };

    let id = object.remove("id").filter(|v| !v.is_null());
    let result = object.remove("result");
    let error = object.remove("error");

    if let Some(id) = id {
        if result.is_some() || error.is_some() {
            let id = id
                .as_u64()
                .ok_or_else(|| ProtocolError::InvalidId(id.to_string()))?;
            return match (result, error) {
                (Some(_), Some(_)) => Err(ProtocolError::AmbiguousOutcome { id }),
                (Some(result), None) => Ok(InboundMessage::Response(Response::success(id, result))),
                (None, Some(error)) => Ok(InboundMessage::Response(Response::failure(
                    id,
                    RpcError::from_value(error),
                ))),
                (None, None) => Err(ProtocolError::MissingOutcome { id }),
            };
        }
        if !matches!(object.get("method"), Some(Value::String(_))) {
            return Err(match id.as_u64() {
                Some(id) => ProtocolError::MissingOutcome { id },
                None => ProtocolError::InvalidId(id.to_string()),
            });
        }
    }

    match object.remove("method") {
        Some(Value::String(method)) => Ok(InboundMessage::Notification(Notification {
            method,
            params: object.remove("params").unwrap_or(Value::Null),
        })),
        _ => Err(ProtocolError::UnrecognizedMessage),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

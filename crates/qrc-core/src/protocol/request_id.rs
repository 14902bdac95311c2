//! Thread-safe request-id counter for JSON-RPC correlation.
//!
//! # What is a request id? (for beginners)
//!
//! Every request the client sends carries an integer `id`.  The Core copies
//! that `id` into its response, which is how the client knows which waiting
//! caller a response belongs to, even when responses arrive out of order.
//!
//! Each connection owns its own counter, so two connections never hand out
//! interleaved ids.
//!
//! # Id space
//!
//! Ids run from `1` to [`MAX_REQUEST_ID`] and then wrap back to `1`.  `0` is
//! never issued.  After a wrap the connection skips any id that is still
//! waiting for a response.
//!
//! # Thread safety
//!
//! The counter uses `AtomicU64` internally, so the foreground caller and the
//! keep-alive task can both draw ids at the same time without a lock and
//! without ever receiving the same value.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::protocol::messages::RequestId;

/// Largest id issued before wrapping back to 1.
pub const MAX_REQUEST_ID: RequestId = u32::MAX as RequestId;

/// A thread-safe, monotonically increasing source of request ids.
///
/// # Examples
///
/// ```rust
/// use qrc_core::protocol::RequestIdCounter;
///
/// let ids = RequestIdCounter::new();
/// assert_eq!(ids.next(), 1);
/// assert_eq!(ids.next(), 2);
/// ```
#[derive(Debug)]
pub struct RequestIdCounter {
    /// The id the next call to [`next`](Self::next) returns.
    next: AtomicU64,
}

impl RequestIdCounter {
    /// Creates a counter whose first id is 1.
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Creates a counter whose first id is `first`.
    ///
    /// Values outside `1..=MAX_REQUEST_ID` are clamped into the id space.
    pub fn starting_at(first: RequestId) -> Self {
        Self {
            next: AtomicU64::new(first.clamp(1, MAX_REQUEST_ID)),
        }
    }

    /// Returns the next id and atomically advances the counter, wrapping from
    /// [`MAX_REQUEST_ID`] to 1.
    ///
    /// `Ordering::Relaxed` is sufficient: ids only need to be unique, they do
    /// not publish any other memory.
    pub fn next(&self) -> RequestId {
        let advance = |id: RequestId| Some(if id >= MAX_REQUEST_ID { 1 } else { id + 1 });
        match self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, advance)
        {
            Ok(id) | Err(id) => id,
        }
    }

    /// Returns the id the next call to [`next`](Self::next) would produce.
    pub fn peek(&self) -> RequestId {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for RequestIdCounter {
    fn default() -> Self {
        Self::new()
    }
}

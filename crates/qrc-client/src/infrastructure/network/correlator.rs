//! Correlator: matches responses to the requests that are waiting for them.
//!
//! # How correlation works (for beginners)
//!
//! The Core answers requests asynchronously and, in principle, out of order.
//! Before a request is written to the socket, the sender registers its `id`
//! here and receives a [`PendingResponse`] handle.  When the receive loop
//! decodes a response it calls [`Correlator::resolve`], which looks the `id`
//! up, hands the response to the matching handle, and removes the entry.
//!
//! ```text
//! sender ── register(7) ──► { 7: slot }  ◄── resolve(7) ── receive loop
//!    │                          │
//!    └── wait(timeout) ◄────────┘ (at most once)
//! ```
//!
//! # Locking
//!
//! The table is a `HashMap` behind one `std::sync::Mutex`.  The lock is only
//! held for a map insert or remove, never across an `.await`, so neither the
//! sender nor the receive loop can stall the other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use qrc_core::{RequestId, Response};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Errors raised by the correlator.
#[derive(Debug, Error, PartialEq)]
pub enum CorrelatorError {
    /// A slot for this id already exists.
    #[error("request id {0} is already pending")]
    DuplicateId(RequestId),

    /// No response arrived before the deadline.
    #[error("request {id} timed out after {timeout:?}")]
    TimedOut { id: RequestId, timeout: Duration },

    /// The slot was dropped (disconnect or transport failure) before a
    /// response arrived.
    #[error("request {0} was cancelled before a response arrived")]
    Cancelled(RequestId),
}

/// What [`Correlator::resolve`] did with a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Handed to the waiting caller.
    Delivered,
    /// No slot for this id: a duplicate or a response after timeout.
    Unknown,
    /// The slot existed but its handle had already been dropped.
    Abandoned,
}

type Slots = HashMap<RequestId, oneshot::Sender<Response>>;

/// The pending-request table of one connection.
///
/// Cloning is cheap and yields a handle to the same table.
#[derive(Clone, Default)]
pub struct Correlator {
    slots: Arc<Mutex<Slots>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a single-resolution slot for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`CorrelatorError::DuplicateId`] if `id` is already pending.
    pub fn register(&self, id: RequestId) -> Result<PendingResponse, CorrelatorError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut slots = self.lock();
            if slots.contains_key(&id) {
                return Err(CorrelatorError::DuplicateId(id));
            }
            slots.insert(id, tx);
        }
        Ok(PendingResponse {
            id,
            rx,
            correlator: self.clone(),
            settled: false,
        })
    }

    /// Delivers `response` to the slot registered for its id, exactly once.
    ///
    /// An unknown id is a protocol anomaly, logged and otherwise ignored.
    pub fn resolve(&self, response: Response) -> Resolution {
        let id = response.id;
        let slot = self.lock().remove(&id);
        match slot {
            Some(tx) => match tx.send(response) {
                Ok(()) => Resolution::Delivered,
                Err(_) => {
                    debug!(id, "response arrived after its waiter went away");
                    Resolution::Abandoned
                }
            },
            None => {
                warn!(id, "response for unknown request id (duplicate or late); dropping");
                Resolution::Unknown
            }
        }
    }

    /// Removes the slot for `id`; returns whether one existed.
    pub fn cancel(&self, id: RequestId) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Drops every slot.  Waiters observe [`CorrelatorError::Cancelled`].
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        drained.len()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_pending(&self, id: RequestId) -> bool {
        self.lock().contains_key(&id)
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        // A panic while holding the lock cannot leave the map half-updated,
        // so a poisoned lock is still safe to use.
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to one pending request.
///
/// Dropping the handle without a response removes its slot, so a late
/// response is treated as unknown.
pub struct PendingResponse {
    id: RequestId,
    rx: oneshot::Receiver<Response>,
    correlator: Correlator,
    /// True once the response has been taken out of `rx`.
    settled: bool,
}

impl PendingResponse {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Waits for the response, at most `timeout`.
    ///
    /// # Errors
    ///
    /// - [`CorrelatorError::TimedOut`] when the deadline passes; the slot is
    ///   removed first, so a response arriving afterwards is dropped.
    /// - [`CorrelatorError::Cancelled`] when the slot was dropped by
    ///   [`Correlator::cancel_all`].
    pub async fn wait(mut self, timeout: Duration) -> Result<Response, CorrelatorError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(response)) => {
                self.settled = true;
                Ok(response)
            }
            Ok(Err(_)) => Err(CorrelatorError::Cancelled(self.id)),
            Err(_elapsed) => {
                self.correlator.cancel(self.id);
                // The receive loop may have resolved the slot between the
                // deadline and the removal above.
                match self.rx.try_recv() {
                    Ok(response) => {
                        self.settled = true;
                        Ok(response)
                    }
                    Err(_) => Err(CorrelatorError::TimedOut {
                        id: self.id,
                        timeout,
                    }),
                }
            }
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if !self.settled {
            self.correlator.cancel(self.id);
        }
    }
}

impl std::fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResponse")
            .field("id", &self.id)
            .field("settled", &self.settled)
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    const WAIT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_resolve_delivers_to_registered_waiter() {
        // Arrange
        let correlator = Correlator::new();
        let pending = correlator.register(1).unwrap();

        // Act
        let resolution = correlator.resolve(Response::success(1, json!({"Status": "OK"})));
        let response = pending.wait(WAIT).await.unwrap();

        // Assert
        assert_eq!(resolution, Resolution::Delivered);
        assert_eq!(response.result(), Some(&json!({"Status": "OK"})));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn test_register_duplicate_id_fails() {
        let correlator = Correlator::new();
        let _first = correlator.register(5).unwrap();
        assert_eq!(
            correlator.register(5).unwrap_err(),
            CorrelatorError::DuplicateId(5)
        );
    }

    #[tokio::test]
    async fn test_second_resolution_of_same_id_is_a_noop() {
        // Arrange
        let correlator = Correlator::new();
        let pending = correlator.register(7).unwrap();

        // Act
        let first = correlator.resolve(Response::success(7, json!("first")));
        let second = correlator.resolve(Response::success(7, json!("second")));
        let response = pending.wait(WAIT).await.unwrap();

        // Assert
        assert_eq!(first, Resolution::Delivered);
        assert_eq!(second, Resolution::Unknown);
        assert_eq!(response.result(), Some(&json!("first")));
    }

    #[tokio::test]
    async fn test_timeout_removes_slot_and_late_response_is_dropped() {
        // Arrange
        let correlator = Correlator::new();
        let pending = correlator.register(3).unwrap();

        // Act – wait with a 50ms deadline, then let another 50ms pass
        let started = std::time::Instant::now();
        let result = pending.wait(Duration::from_millis(50)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let late = correlator.resolve(Response::success(3, json!(true)));

        // Assert
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(
            result.unwrap_err(),
            CorrelatorError::TimedOut {
                id: 3,
                timeout: Duration::from_millis(50)
            }
        );
        assert_eq!(late, Resolution::Unknown);
        assert!(!correlator.is_pending(3));
    }

    #[tokio::test]
    async fn test_responses_matched_by_id_not_arrival_order() {
        // Arrange
        let correlator = Correlator::new();
        let a = correlator.register(10).unwrap();
        let b = correlator.register(11).unwrap();

        // Act – answer in reverse order
        correlator.resolve(Response::success(11, json!("b")));
        correlator.resolve(Response::success(10, json!("a")));

        // Assert
        assert_eq!(a.wait(WAIT).await.unwrap().result(), Some(&json!("a")));
        assert_eq!(b.wait(WAIT).await.unwrap().result(), Some(&json!("b")));
    }

    #[test]
    fn test_dropping_handle_unregisters_slot() {
        let correlator = Correlator::new();
        let pending = correlator.register(4).unwrap();
        assert!(correlator.is_pending(4));
        drop(pending);
        assert!(!correlator.is_pending(4));
        assert_eq!(
            correlator.resolve(Response::success(4, json!(null))),
            Resolution::Unknown
        );
    }

    #[tokio::test]
    async fn test_cancel_all_wakes_waiters_with_cancelled() {
        // Arrange
        let correlator = Correlator::new();
        let pending = correlator.register(8).unwrap();

        // Act
        let cancelled = correlator.cancel_all();
        let result = pending.wait(WAIT).await;

        // Assert
        assert_eq!(cancelled, 1);
        assert_eq!(result.unwrap_err(), CorrelatorError::Cancelled(8));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_waiter_on_another_task_receives_resolution() {
        let correlator = Correlator::new();
        let pending = correlator.register(12).unwrap();
        let waiter = tokio::spawn(async move { pending.wait(WAIT).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        correlator.resolve(Response::success(12, json!({"ok": true})));

        let response = assert_ok!(waiter.await.expect("task panicked"));
        assert_eq!(response.id, 12);
    }

    #[test]
    fn test_cancel_unknown_id_returns_false() {
        let correlator = Correlator::new();
        assert!(!correlator.cancel(99));
        assert_err!(correlator.register(1).and_then(|_p| correlator.register(1)));
    }
}

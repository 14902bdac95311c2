//! Idle tracking for the keep-alive task.
//!
//! The Core drops sessions that stay silent for about a minute.  The
//! connection records the time of every frame sent or received in an
//! [`ActivityClock`]; the keep-alive task wakes every `check_interval` and,
//! when [`KeepAlive::is_due`] says so, sends a `NoOp`.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// How often to look at the clock and how much silence to tolerate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive {
    pub check_interval: Duration,
    pub idle_threshold: Duration,
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            idle_threshold: Duration::from_secs(45),
        }
    }
}

impl KeepAlive {
    pub fn is_due(&self, idle: Duration) -> bool {
        idle >= self.idle_threshold
    }
}

/// Timestamp of the last traffic in either direction.
#[derive(Debug)]
pub struct ActivityClock {
    last: Mutex<Instant>,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

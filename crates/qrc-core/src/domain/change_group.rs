//! Change groups: client-side record of the groups live on the Core.
//!
//! A change group is a named set of controls the Core watches for changes.
//! The client can poll a group (`ChangeGroup.Poll`) or ask the Core to push
//! changes periodically (`ChangeGroup.AutoPoll`).
//!
//! # Lifecycle (for beginners)
//!
//! ```text
//! AddComponentControl ──►  live  ──►  Destroy
//!                           │
//!                     disconnect (Core discards every group)
//! ```
//!
//! The Core accepts at most [`MAX_CHANGE_GROUPS`] groups per connection.  The
//! registry enforces that limit locally, so a fifth group is refused before
//! any request reaches the wire.

use thiserror::Error;
use tracing::debug;

/// Number of change groups a Core allows on one connection.
pub const MAX_CHANGE_GROUPS: usize = 4;

/// Errors raised by change-group bookkeeping.
#[derive(Debug, Error, PartialEq)]
pub enum ChangeGroupError {
    #[error("change group limit reached: at most {limit} groups may be active")]
    LimitReached { limit: usize },
    #[error("unknown change group: {0}")]
    UnknownGroup(String),
    #[error("invalid auto-poll rate {0}: must be a positive number of seconds")]
    InvalidRate(f64),
}

/// A change group as tracked by the client.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeGroup {
    id: String,
    /// Control names in insertion order, without duplicates.
    controls: Vec<String>,
    /// Auto-poll interval in seconds, once enabled.
    auto_poll_rate: Option<f64>,
}

impl ChangeGroup {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            controls: Vec::new(),
            auto_poll_rate: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn controls(&self) -> &[String] {
        &self.controls
    }

    pub fn auto_poll_rate(&self) -> Option<f64> {
        self.auto_poll_rate
    }

    /// Adds controls not already tracked; returns how many were new.
    pub fn add_controls<I, S>(&mut self, controls: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let before = self.controls.len();
        for name in controls {
            let name = name.into();
            if !self.controls.contains(&name) {
                self.controls.push(name);
            }
        }
        self.controls.len() - before
    }
}

/// The set of change groups live on the current connection.
///
/// Groups are kept in creation order; with at most four entries a `Vec` is the
/// simplest correct container.
#[derive(Debug, Default)]
pub struct ChangeGroupRegistry {
    groups: Vec<ChangeGroup>,
}

impl ChangeGroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ChangeGroup> {
        self.groups.iter().find(|g| g.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChangeGroup> {
        self.groups.iter()
    }

    /// Checks whether a request touching group `id` may be sent.
    ///
    /// Existing groups always pass; a new group passes only while fewer than
    /// [`MAX_CHANGE_GROUPS`] are live.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeGroupError::LimitReached`] when `id` would be a fifth group.
    pub fn check_capacity(&self, id: &str) -> Result<(), ChangeGroupError> {
        if self.contains(id) || self.groups.len() < MAX_CHANGE_GROUPS {
            Ok(())
        } else {
            Err(ChangeGroupError::LimitReached {
                limit: MAX_CHANGE_GROUPS,
            })
        }
    }

    /// Records controls added to group `id`, creating the group if needed.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeGroupError::LimitReached`] when creating the group would
    /// exceed the limit.
    pub fn record_controls<I, S>(&mut self, id: &str, controls: I) -> Result<&ChangeGroup, ChangeGroupError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let group = self.entry(id)?;
        group.add_controls(controls);
        Ok(group)
    }

    /// Records the auto-poll rate of group `id`, creating the group if needed
    /// (the Core creates an empty group for an unknown id).
    ///
    /// # Errors
    ///
    /// Returns [`ChangeGroupError::InvalidRate`] for a non-positive or
    /// non-finite rate and [`ChangeGroupError::LimitReached`] when creating the
    /// group would exceed the limit.
    pub fn record_auto_poll(&mut self, id: &str, rate: f64) -> Result<(), ChangeGroupError> {
        validate_rate(rate)?;
        self.entry(id)?.auto_poll_rate = Some(rate);
        Ok(())
    }

    /// Forgets group `id`.
    pub fn remove(&mut self, id: &str) -> Option<ChangeGroup> {
        let index = self.groups.iter().position(|g| g.id == id)?;
        debug!(group = id, "forgetting change group");
        Some(self.groups.remove(index))
    }

    /// Forgets every group; called when the connection goes away.
    pub fn clear(&mut self) {
        self.groups.clear();
    }

    fn entry(&mut self, id: &str) -> Result<&mut ChangeGroup, ChangeGroupError> {
        self.check_capacity(id)?;
        let index = match self.groups.iter().position(|g| g.id == id) {
            Some(index) => index,
            None => {
                debug!(group = id, live = self.groups.len() + 1, "tracking new change group");
                self.groups.push(ChangeGroup::new(id));
                self.groups.len() - 1
            }
        };
        Ok(&mut self.groups[index])
    }
}

/// Rejects auto-poll rates the Core cannot honour.
///
/// # Errors
///
/// Returns [`ChangeGroupError::InvalidRate`] unless `rate` is finite and > 0.
pub fn validate_rate(rate: f64) -> Result<(), ChangeGroupError> {
    if rate.is_finite() && rate > 0.0 {
        Ok(())
    } else {
        Err(ChangeGroupError::InvalidRate(rate))
    }
}

//! Notification router: fans server-pushed notifications out to subscribers.
//!
//! Two kinds of subscription exist:
//!
//! - **by method**: every notification whose `method` matches, e.g.
//!   `EngineStatus`.
//! - **by change group**: every `ChangeGroup.*` notification whose
//!   `params.Id` matches.  Several groups can auto-poll at once, so routing
//!   must look at the group id rather than the method alone.
//!
//! Delivery never blocks the receive loop: a subscriber whose queue is full
//! misses that notification, and a subscriber whose receiver was dropped is
//! pruned on the next delivery attempt.  A notification that only reached
//! full queues still counts as claimed, so it is not also reported as
//! unhandled.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use qrc_core::Notification;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Queue depth of each subscription.
pub const SUBSCRIPTION_CAPACITY: usize = 64;

/// Method prefix shared by all change-group traffic.
const CHANGE_GROUP_PREFIX: &str = "ChangeGroup.";

#[derive(Default)]
struct Routes {
    by_method: HashMap<String, Vec<mpsc::Sender<Notification>>>,
    by_group: HashMap<String, Vec<mpsc::Sender<Notification>>>,
}

#[derive(Default)]
pub struct NotificationRouter {
    routes: Mutex<Routes>,
}

impl NotificationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to every notification with the given method name.
    pub fn subscribe_method(&self, method: &str) -> mpsc::Receiver<Notification> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        self.lock()
            .by_method
            .entry(method.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Subscribes to change-group notifications carrying `Id == group_id`.
    pub fn subscribe_change_group(&self, group_id: &str) -> mpsc::Receiver<Notification> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        self.lock()
            .by_group
            .entry(group_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Delivers `notification` to every matching subscriber.
    ///
    /// Returns the number of live subscribers it matched, including those
    /// whose queue was full; zero means the caller should treat it as
    /// unhandled.
    pub fn route(&self, notification: &Notification) -> usize {
        let mut routes = self.lock();
        let mut claimed = 0;

        if let Some(subscribers) = routes.by_method.get_mut(&notification.method) {
            claimed += deliver(subscribers, notification);
        }
        if notification.method.starts_with(CHANGE_GROUP_PREFIX) {
            if let Some(group_id) = notification.change_group_id() {
                if let Some(subscribers) = routes.by_group.get_mut(group_id) {
                    claimed += deliver(subscribers, notification);
                }
            }
        }

        routes.by_method.retain(|_, subs| !subs.is_empty());
        routes.by_group.retain(|_, subs| !subs.is_empty());
        claimed
    }

    /// Drops every subscription; receivers then yield `None`.
    pub fn clear(&self) {
        let mut routes = self.lock();
        routes.by_method.clear();
        routes.by_group.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        let routes = self.lock();
        routes.by_method.values().map(Vec::len).sum::<usize>()
            + routes.by_group.values().map(Vec::len).sum::<usize>()
    }

    fn lock(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Returns how many live subscribers matched.
fn deliver(subscribers: &mut Vec<mpsc::Sender<Notification>>, notification: &Notification) -> usize {
    let mut claimed = 0;
    subscribers.retain(|tx| match tx.try_send(notification.clone()) {
        Ok(()) => {
            claimed += 1;
            true
        }
        Err(TrySendError::Full(_)) => {
            warn!(method = %notification.method, "subscriber queue full; notification dropped");
            claimed += 1;
            true
        }
        Err(TrySendError::Closed(_)) => {
            debug!(method = %notification.method, "pruning closed subscriber");
            false
        }
    });
    claimed
}

//! High-level QRC client: login, status, and change groups.
//!
//! `QrcClient` turns typed calls into JSON-RPC requests on an [`RpcChannel`]
//! and keeps the [`ChangeGroupRegistry`] in step with what the Core holds.
//!
//! # Why a trait? (for beginners)
//!
//! The client never touches a socket.  It talks to "something that can send
//! a request and wait for the response", expressed as the [`RpcChannel`]
//! trait.  The network `Connection` implements it in production; unit tests
//! use a generated mock, so the change-group rules can be tested without a
//! Core on the network.

use std::time::Duration;

use async_trait::async_trait;
use qrc_core::domain::change_group::{validate_rate, ChangeGroup};
use qrc_core::protocol::{
    methods, AddComponentControlParams, AutoPollParams, ChangeGroupIdParams, ChangeGroupUpdate,
    LogonParams,
};
use qrc_core::{ChangeGroupRegistry, Notification, QrcError, Response};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Request/response transport used by [`QrcClient`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RpcChannel: Send + Sync {
    async fn connect(&self) -> Result<(), QrcError>;

    async fn disconnect(&self);

    /// Sends `method` and waits up to `timeout` for the matching response.
    async fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Response, QrcError>;

    /// Notifications with the given method name.
    fn subscribe(&self, method: &str) -> mpsc::Receiver<Notification>;

    /// Change-group notifications for `group_id`.
    fn subscribe_change_group(&self, group_id: &str) -> mpsc::Receiver<Notification>;
}

/// Typed client for one Core.
pub struct QrcClient<C> {
    channel: C,
    request_timeout: Duration,
    /// Held across the request that mutates a group, which serializes
    /// change-group operations and keeps the capacity check honest.
    change_groups: Mutex<ChangeGroupRegistry>,
}

impl<C: RpcChannel> QrcClient<C> {
    pub fn new(channel: C, request_timeout: Duration) -> Self {
        Self {
            channel,
            request_timeout,
            change_groups: Mutex::new(ChangeGroupRegistry::new()),
        }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Connects the channel.  Change groups from any earlier session are
    /// forgotten; the Core discards them when a session ends.
    pub async fn connect(&self) -> Result<(), QrcError> {
        self.change_groups.lock().await.clear();
        self.channel.connect().await
    }

    pub async fn disconnect(&self) {
        self.channel.disconnect().await;
        self.change_groups.lock().await.clear();
    }

    /// Sends any method and returns its `result`.
    ///
    /// # Errors
    ///
    /// [`QrcError::Rpc`] when the Core answers with an error payload, plus
    /// every transport error of [`RpcChannel::call`].
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, QrcError> {
        let response = self.channel.call(method, params, self.request_timeout).await?;
        response.into_result().map_err(|error| {
            debug!(method, code = error.code, "Core returned an error");
            QrcError::Rpc {
                method: method.to_string(),
                error,
            }
        })
    }

    /// Authenticates the session.
    ///
    /// # Errors
    ///
    /// [`QrcError::Authentication`] when the Core rejects the credentials.
    pub async fn login(&self, user: &str, password: &str) -> Result<(), QrcError> {
        let params = to_params(&LogonParams {
            user: user.to_string(),
            password: password.to_string(),
        })?;
        let response = self
            .channel
            .call(methods::LOGON, params, self.request_timeout)
            .await?;
        match response.into_result() {
            Ok(_) => {
                info!(user, "logged in to Core");
                Ok(())
            }
            Err(error) => {
                warn!(user, code = error.code, "login rejected");
                Err(QrcError::Authentication(error))
            }
        }
    }

    /// Returns the `StatusGet` result (platform, state, design name, ...).
    pub async fn request_status(&self) -> Result<Value, QrcError> {
        self.call(methods::STATUS_GET, json!({})).await
    }

    /// Adds controls of `component` to change group `group_id`, creating the
    /// group on first use.
    ///
    /// # Errors
    ///
    /// Fails with the `Capacity` kind, before anything is sent, when
    /// `group_id` would be a fifth group.
    pub async fn create_change_group<I, S>(
        &self,
        group_id: &str,
        component: &str,
        controls: I,
    ) -> Result<(), QrcError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let controls: Vec<String> = controls.into_iter().map(Into::into).collect();
        let mut groups = self.change_groups.lock().await;
        groups.check_capacity(group_id)?;

        let params = AddComponentControlParams::new(group_id, component, controls.iter().cloned());
        self.call(methods::CHANGE_GROUP_ADD_COMPONENT_CONTROL, to_params(&params)?)
            .await?;

        let group = groups.record_controls(group_id, controls)?;
        info!(
            group = group_id,
            component,
            controls = group.controls().len(),
            "change group updated"
        );
        Ok(())
    }

    /// Asks the Core to push changes of `group_id` every `rate` seconds.
    ///
    /// # Errors
    ///
    /// Fails with the `InvalidRequest` kind for a rate that is not a positive
    /// number and with the `Capacity` kind when `group_id` would be a fifth
    /// group.  Neither sends anything.
    pub async fn set_auto_poll(&self, group_id: &str, rate: f64) -> Result<(), QrcError> {
        validate_rate(rate)?;
        let mut groups = self.change_groups.lock().await;
        groups.check_capacity(group_id)?;

        let params = AutoPollParams {
            id: group_id.to_string(),
            rate,
        };
        self.call(methods::CHANGE_GROUP_AUTO_POLL, to_params(&params)?)
            .await?;

        groups.record_auto_poll(group_id, rate)?;
        info!(group = group_id, rate, "auto-poll enabled");
        Ok(())
    }

    /// Fetches the controls of `group_id` that changed since the last poll.
    pub async fn poll_change_group(&self, group_id: &str) -> Result<ChangeGroupUpdate, QrcError> {
        let params = ChangeGroupIdParams {
            id: group_id.to_string(),
        };
        let result = self
            .call(methods::CHANGE_GROUP_POLL, to_params(&params)?)
            .await?;
        serde_json::from_value(result)
            .map_err(|e| QrcError::Protocol(format!("unexpected ChangeGroup.Poll result: {e}")))
    }

    /// Destroys `group_id` on the Core and frees its slot.
    pub async fn destroy_change_group(&self, group_id: &str) -> Result<(), QrcError> {
        let mut groups = self.change_groups.lock().await;
        let params = ChangeGroupIdParams {
            id: group_id.to_string(),
        };
        self.call(methods::CHANGE_GROUP_DESTROY, to_params(&params)?)
            .await?;
        if groups.remove(group_id).is_none() {
            debug!(group = group_id, "destroyed a group this client was not tracking");
        }
        info!(group = group_id, "change group destroyed");
        Ok(())
    }

    /// Auto-poll updates pushed for `group_id`.
    pub fn change_group_updates(&self, group_id: &str) -> ChangeGroupUpdates {
        ChangeGroupUpdates {
            group_id: group_id.to_string(),
            rx: self.channel.subscribe_change_group(group_id),
        }
    }

    /// `EngineStatus` notifications.
    pub fn engine_status_updates(&self) -> mpsc::Receiver<Notification> {
        self.channel.subscribe(methods::ENGINE_STATUS)
    }

    /// Snapshot of the tracked change groups, in creation order.
    pub async fn change_groups(&self) -> Vec<ChangeGroup> {
        self.change_groups.lock().await.iter().cloned().collect()
    }
}

/// Stream of parsed updates for one change group.
pub struct ChangeGroupUpdates {
    group_id: String,
    rx: mpsc::Receiver<Notification>,
}

impl ChangeGroupUpdates {
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Waits for the next update.  Returns `None` once the subscription ends.
    pub async fn recv(&mut self) -> Option<ChangeGroupUpdate> {
        while let Some(notification) = self.rx.recv().await {
            match serde_json::from_value(notification.params) {
                Ok(update) => return Some(update),
                Err(e) => warn!(group = %self.group_id, error = %e, "ignoring unparsable change-group update"),
            }
        }
        None
    }
}

fn to_params<T: Serialize>(params: &T) -> Result<Value, QrcError> {
    serde_json::to_value(params).map_err(|e| QrcError::Protocol(format!("failed to encode params: {e}")))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

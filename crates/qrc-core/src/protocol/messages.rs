//! All QRC protocol message types.
//!
//! Every frame on the wire is one JSON-RPC 2.0 object.  Three shapes occur:
//!
//! ```text
//! request       {"jsonrpc":"2.0","method":"StatusGet","params":{},"id":1}
//! response      {"jsonrpc":"2.0","id":1,"result":{...}}   or   "error":{...}
//! notification  {"jsonrpc":"2.0","method":"EngineStatus","params":{...}}
//! ```
//!
//! Requests only ever travel client → Core.  Responses and notifications only
//! ever travel Core → client and are represented by [`InboundMessage`].

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

// ── Protocol constants ────────────────────────────────────────────────────────

/// Value of the `jsonrpc` member on every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Default TCP port of the QRC service on a Core.
pub const DEFAULT_PORT: u16 = 1710;

/// Correlation key carried in the `id` member of requests and responses.
pub type RequestId = u64;

/// Method names understood by the Core that this client uses.
pub mod methods {
    pub const LOGON: &str = "Logon";
    pub const STATUS_GET: &str = "StatusGet";
    pub const NO_OP: &str = "NoOp";
    pub const CHANGE_GROUP_ADD_COMPONENT_CONTROL: &str = "ChangeGroup.AddComponentControl";
    pub const CHANGE_GROUP_AUTO_POLL: &str = "ChangeGroup.AutoPoll";
    pub const CHANGE_GROUP_POLL: &str = "ChangeGroup.Poll";
    pub const CHANGE_GROUP_DESTROY: &str = "ChangeGroup.Destroy";
    /// Pushed by the Core whenever the engine state changes.
    pub const ENGINE_STATUS: &str = "EngineStatus";
}

// ── Envelopes ─────────────────────────────────────────────────────────────────

/// An outgoing JSON-RPC request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    pub jsonrpc: &'static str,
    pub method: String,
    pub params: Value,
    pub id: RequestId,
}

impl Request {
    /// Builds a request envelope.
    ///
    /// QRC expects `params` to be an object, so `null` is replaced by `{}`.
    pub fn new(method: impl Into<String>, params: Value, id: RequestId) -> Self {
        let params = if params.is_null() {
            Value::Object(Map::new())
        } else {
            params
        };
        Self {
            jsonrpc: JSONRPC_VERSION,
            method: method.into(),
            params,
            id,
        }
    }
}

/// The `error` member of a failed response.
///
/// Q-SYS Cores send `{"code": <int>, "message": <string>}`.  Both fields
/// default when missing so a non-conforming payload is still surfaced.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, Error)]
#[error("{message} (code {code})")]
pub struct RpcError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Interprets any JSON value as an error payload.
    ///
    /// Objects are deserialized field by field; strings become the message;
    /// anything else is kept verbatim in `data`.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(_) => serde_json::from_value(value.clone()).unwrap_or_else(|_| Self {
                code: 0,
                message: value.to_string(),
                data: Some(value),
            }),
            Value::String(message) => Self {
                code: 0,
                message,
                data: None,
            },
            other => Self {
                code: 0,
                message: other.to_string(),
                data: Some(other),
            },
        }
    }
}

/// A response matched to a request by `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub outcome: Result<Value, RpcError>,
}

impl Response {
    /// Successful response carrying `result`.
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id,
            outcome: Ok(result),
        }
    }

    /// Failed response carrying `error`.
    pub fn failure(id: RequestId, error: RpcError) -> Self {
        Self {
            id,
            outcome: Err(error),
        }
    }

    pub fn result(&self) -> Option<&Value> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&RpcError> {
        self.outcome.as_ref().err()
    }

    pub fn into_result(self) -> Result<Value, RpcError> {
        self.outcome
    }
}

/// A server-originated message with a `method` and no `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Notification {
    /// The `Id` member of the params, present on change-group traffic.
    pub fn change_group_id(&self) -> Option<&str> {
        self.params.get("Id").and_then(Value::as_str)
    }
}

/// Any message the Core can send to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Response(Response),
    Notification(Notification),
}

// ── Method parameters ─────────────────────────────────────────────────────────

/// `Logon` params.
#[derive(Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LogonParams {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for LogonParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogonParams")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Params of change-group methods that only name the group
/// (`ChangeGroup.Poll`, `ChangeGroup.Destroy`).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChangeGroupIdParams {
    pub id: String,
}

/// `ChangeGroup.AddComponentControl` params.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AddComponentControlParams {
    pub id: String,
    pub component: ComponentControls,
}

/// A named component and the controls on it to track.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ComponentControls {
    pub name: String,
    pub controls: Vec<ControlRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ControlRef {
    pub name: String,
}

impl AddComponentControlParams {
    pub fn new<I, S>(group_id: impl Into<String>, component: impl Into<String>, controls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: group_id.into(),
            component: ComponentControls {
                name: component.into(),
                controls: controls
                    .into_iter()
                    .map(|name| ControlRef { name: name.into() })
                    .collect(),
            },
        }
    }
}

/// `ChangeGroup.AutoPoll` params.  `rate` is in seconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AutoPollParams {
    pub id: String,
    pub rate: f64,
}

// ── Change-group results ──────────────────────────────────────────────────────

/// Result of `ChangeGroup.Poll`, also pushed by the Core while auto-polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChangeGroupUpdate {
    pub id: String,
    #[serde(default)]
    pub changes: Vec<ControlChange>,
}

/// One changed control inside a [`ChangeGroupUpdate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ControlChange {
    /// Present for component controls, absent for named controls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<f64>,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

//! Error taxonomy shared by every public operation of the QRC client.
//!
//! Callers branch on [`QrcError::kind`] rather than on message text:
//!
//! | Kind             | Meaning                                                    |
//! |------------------|------------------------------------------------------------|
//! | `Connection`     | The socket could not be opened or an active one failed.    |
//! | `Protocol`       | A malformed frame, or a send on an inactive connection.    |
//! | `Authentication` | `Logon` was answered with an error payload.                |
//! | `Timeout`        | No matching response arrived before the deadline.          |
//! | `Capacity`       | A fifth change group was requested.                        |
//! | `InvalidRequest` | The caller passed arguments the Core cannot accept.        |
//! | `Rpc`            | The Core answered any other request with an error payload. |

use std::time::Duration;

use thiserror::Error;

use crate::domain::change_group::ChangeGroupError;
use crate::protocol::framer::{FrameError, ProtocolError};
use crate::protocol::messages::{RequestId, RpcError};

/// Coarse classification of a [`QrcError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    Protocol,
    Authentication,
    Timeout,
    Capacity,
    InvalidRequest,
    Rpc,
}

/// Error type returned by connection and client operations.
#[derive(Debug, Error)]
pub enum QrcError {
    /// TCP connection to the Core failed.
    #[error("failed to connect to Core at {addr}: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// An established connection failed, or was torn down while a request
    /// was outstanding.
    #[error("connection to Core lost: {0}")]
    ConnectionLost(String),

    /// A request was attempted while the connection is not `Connected`.
    #[error("not connected to Core")]
    NotConnected,

    /// A message could not be encoded, decoded, or correlated.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The Core rejected the `Logon` credentials.
    #[error("login failed: {0}")]
    Authentication(RpcError),

    /// No response arrived before the deadline.
    #[error("{method} (id {id}) timed out after {timeout:?}")]
    Timeout {
        method: String,
        id: RequestId,
        timeout: Duration,
    },

    /// Change-group bookkeeping refused the request.
    #[error(transparent)]
    ChangeGroup(#[from] ChangeGroupError),

    /// The Core answered with an error payload.
    #[error("Core returned an error for {method}: {error}")]
    Rpc { method: String, error: RpcError },
}

impl QrcError {
    /// Returns the classification callers branch on.
    pub fn kind(&self) -> ErrorKind {
        match self {
            QrcError::ConnectFailed { .. } | QrcError::ConnectionLost(_) => ErrorKind::Connection,
            QrcError::NotConnected | QrcError::Protocol(_) => ErrorKind::Protocol,
            QrcError::Authentication(_) => ErrorKind::Authentication,
            QrcError::Timeout { .. } => ErrorKind::Timeout,
            QrcError::ChangeGroup(ChangeGroupError::LimitReached { .. }) => ErrorKind::Capacity,
            QrcError::ChangeGroup(_) => ErrorKind::InvalidRequest,
            QrcError::Rpc { .. } => ErrorKind::Rpc,
        }
    }

    /// `true` when the connection that produced this error is no longer usable.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Connection
    }
}

impl From<ProtocolError> for QrcError {
    fn from(err: ProtocolError) -> Self {
        QrcError::Protocol(err.to_string())
    }
}

impl From<FrameError> for QrcError {
    fn from(err: FrameError) -> Self {
        QrcError::Protocol(err.to_string())
    }
}

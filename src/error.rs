use thiserror::Error;

use crate::close_code::CloseCode;

/// Errors surfaced by the relay stream and its collaborators.
///
/// Transient close codes sent by the relay never show up here: the session retries those
///  internally and only reports [RelayError::ServerClosed] once its reconnect budget is used up.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// A message is shorter than its fixed header or its declared length
    #[error("message is truncated")]
    Truncated,

    /// Malformed or out-of-sequence data from the relay
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The caller violated a size precondition
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The stream was closed by the caller
    #[error("the connection was closed by the client")]
    ClientClosed,

    /// The relay closed the WebSocket with the given close code
    #[error("the connection was closed by the server: {code} {reason}")]
    ServerClosed {
        code: CloseCode,
        reason: String,
    },

    /// The relay denied access (IAM)
    #[error("{0}")]
    Denied(String),

    /// The connection broke and the session could not be resumed
    #[error("{0}")]
    ReconnectFailed(String),

    /// The relay could not connect to the backend
    #[error("{0}")]
    ConnectFailed(String),

    /// The relay could not find the backend
    #[error("{0}")]
    BackendNotFound(String),

    /// The WebSocket upgrade was refused before the relay protocol got involved, e.g. by a proxy
    #[error("the connection was denied: {0}")]
    ConnectionDenied(String),

    #[error("{0}")]
    Timeout(String),

    /// Any other failure of the underlying transport
    #[error("transport error: {0}")]
    Transport(String),
}

impl RelayError {
    pub fn protocol_violation(msg: impl Into<String>) -> RelayError {
        RelayError::ProtocolViolation(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> RelayError {
        RelayError::InvalidArgument(msg.into())
    }

    pub fn server_closed(code: CloseCode, reason: impl Into<String>) -> RelayError {
        RelayError::ServerClosed {
            code,
            reason: reason.into(),
        }
    }
}

//! ---
//! cs_section: "02-rpc-pipeline"
//! cs_subsection: "module"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "Error taxonomy for capability calls."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
use capnp::ErrorKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Shared result type for RPC operations.
pub type RpcResult<T> = std::result::Result<T, RpcError>;

/// Classification carried by errors raised on the remote side of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RemoteErrorKind {
    /// Generic application failure.
    Failed,
    /// The remote has no capacity left (e.g. no free model instance).
    Overloaded,
    /// The remote object does not implement the requested method.
    Unimplemented,
}

/// Errors surfaced by capability calls and promise joins.
///
/// Transport-level variants (`Transport`, `Disconnected`) invalidate the whole
/// connection; `Remote` is local to one call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RpcError {
    /// Connecting or writing to the peer failed.
    #[error("transport error ({peer}): {reason}")]
    Transport { peer: String, reason: String },
    /// The connection closed while the call was outstanding, or before it was made.
    #[error("connection lost: {reason}")]
    Disconnected { reason: String },
    /// The remote method itself reported failure.
    #[error("remote {kind} error: {message}")]
    Remote {
        kind: RemoteErrorKind,
        message: String,
    },
    /// A message did not have the expected shape.
    #[error("malformed payload: {0}")]
    Payload(String),
}

impl RpcError {
    /// Remote application failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Remote {
            kind: RemoteErrorKind::Failed,
            message: message.into(),
        }
    }

    /// Remote capacity exhaustion.
    pub fn overloaded(message: impl Into<String>) -> Self {
        Self::Remote {
            kind: RemoteErrorKind::Overloaded,
            message: message.into(),
        }
    }

    pub fn payload(message: impl Into<String>) -> Self {
        Self::Payload(message.into())
    }

    /// True for errors that invalidate the connection rather than a single call.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Disconnected { .. })
    }

    /// True for application errors reported by the remote method.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }

    /// The remote error kind, when this is a remote application error.
    pub fn remote_kind(&self) -> Option<RemoteErrorKind> {
        match self {
            Self::Remote { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<capnp::Error> for RpcError {
    fn from(err: capnp::Error) -> Self {
        let message = err.extra;
        match err.kind {
            ErrorKind::Disconnected => Self::Disconnected { reason: message },
            ErrorKind::Overloaded => Self::overloaded(message),
            ErrorKind::Unimplemented => Self::Remote {
                kind: RemoteErrorKind::Unimplemented,
                message,
            },
            ErrorKind::Failed => Self::failed(message),
            other => Self::Payload(format!("{other:?}: {message}")),
        }
    }
}

impl From<std::str::Utf8Error> for RpcError {
    fn from(err: std::str::Utf8Error) -> Self {
        Self::Payload(format!("invalid utf-8 text: {err}"))
    }
}

impl From<capnp::NotInSchema> for RpcError {
    fn from(err: capnp::NotInSchema) -> Self {
        Self::Payload(format!("value not in schema: {}", err.0))
    }
}

/// Errors raised while serving a call travel back to the caller with their
/// kind intact.
impl From<RpcError> for capnp::Error {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Remote {
                kind: RemoteErrorKind::Overloaded,
                message,
            } => capnp::Error::overloaded(message),
            RpcError::Remote {
                kind: RemoteErrorKind::Unimplemented,
                message,
            } => capnp::Error::unimplemented(message),
            RpcError::Remote { message, .. } => capnp::Error::failed(message),
            RpcError::Disconnected { reason } => capnp::Error::disconnected(reason),
            other => capnp::Error::failed(other.to_string()),
        }
    }
}

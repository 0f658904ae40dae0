//! ---
//! cs_section: "04-cluster"
//! cs_subsection: "module"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "Error types for provisioning, dispatch and the admin gateway."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::time::Duration;

use cropsim_rpc::{RemoteErrorKind, RpcError};
use thiserror::Error;

use crate::dispatch::BatchOutcome;

/// Failures of the dispatcher and supporting utilities.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("no model instances to dispatch {jobs} jobs to")]
    NoInstances { jobs: usize },
    #[error("invalid job template: {0}")]
    InvalidTemplate(String),
    /// Two jobs of one batch share a correlation id, so their results could
    /// not be told apart. Nothing was submitted.
    #[error("correlation id {id:?} appears more than once in the batch")]
    DuplicateCorrelation { id: String },
    /// A transport failure stopped a windowed batch. `outcome` holds what
    /// completed before and during the failing window.
    #[error("connection lost after {} results: {source}", .outcome.results.len())]
    SessionLost {
        outcome: Box<BatchOutcome>,
        source: RpcError,
    },
    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why obtaining a model instance failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProvisionError {
    /// The factory has no free instance.
    #[error("no capacity: {0}")]
    NoCapacity(String),
    /// Any other failure reported by the factory or holder.
    #[error("provisioning rejected: {0}")]
    Remote(RpcError),
    /// The connection to the cluster failed.
    #[error("provisioning interrupted: {0}")]
    Transport(RpcError),
    /// More instances than one factory request can carry.
    #[error("cannot request {0} instances in one call")]
    InvalidCount(usize),
}

impl From<RpcError> for ProvisionError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Remote {
                kind: RemoteErrorKind::Overloaded,
                message,
            } => ProvisionError::NoCapacity(message),
            err if err.is_transport() => ProvisionError::Transport(err),
            err => ProvisionError::Remote(err),
        }
    }
}

/// Terminal failure states of the admin gateway.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    #[error("gave up on {address} after {attempts} attempts: {last}")]
    Exhausted {
        address: String,
        attempts: u32,
        last: RpcError,
    },
    #[error("timed out after {elapsed:?} and {attempts} attempts connecting to {address}")]
    TimedOut {
        address: String,
        attempts: u32,
        elapsed: Duration,
    },
    #[error("connecting to {address} cancelled after {attempts} attempts")]
    Cancelled { address: String, attempts: u32 },
    /// A non-transport error; retrying would not help.
    #[error("{address} rejected the bootstrap: {source}")]
    Rejected { address: String, source: RpcError },
}

impl GatewayError {
    pub fn attempts(&self) -> Option<u32> {
        match self {
            GatewayError::Exhausted { attempts, .. }
            | GatewayError::TimedOut { attempts, .. }
            | GatewayError::Cancelled { attempts, .. } => Some(*attempts),
            GatewayError::Rejected { .. } => None,
        }
    }

    /// Label used for metrics.
    pub fn outcome(&self) -> &'static str {
        match self {
            GatewayError::Exhausted { .. } => "exhausted",
            GatewayError::TimedOut { .. } => "timed_out",
            GatewayError::Cancelled { .. } => "cancelled",
            GatewayError::Rejected { .. } => "rejected",
        }
    }
}

//! ---
//! cs_section: "03-climate-data"
//! cs_subsection: "module"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "Errors raised while navigating climate data."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
use cropsim_rpc::RpcError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClimateError {
    #[error("invalid coordinate lat={lat} lon={lon}")]
    InvalidCoordinate { lat: f64, lon: f64 },
    #[error("inconsistent time series projections: {0}")]
    Inconsistent(String),
    /// An element this build cannot name cannot be requested either.
    #[error("element #{0} is not known to this client and cannot be requested")]
    UnknownElement(u16),
    #[error("unknown element name {0:?}")]
    UnknownElementName(String),
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl From<ClimateError> for RpcError {
    fn from(err: ClimateError) -> Self {
        match err {
            ClimateError::Rpc(inner) => inner,
            other => RpcError::payload(other.to_string()),
        }
    }
}

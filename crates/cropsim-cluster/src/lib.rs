//! ---
//! cs_section: "04-cluster"
//! cs_subsection: "module"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "Cluster client crate exports."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
//! Client side of the model cluster: reach the admin master, provision model
//! instances, and fan jobs out over them.

pub mod admin;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod model;
pub mod provisioner;
pub mod sturdy_store;

pub use admin::AdminMaster;
pub use dispatch::{
    BatchOutcome, DispatchOptions, Dispatcher, FailureKind, JobFailure, PendingJob,
    DEFAULT_CORRELATION_FIELD,
};
pub use error::{ClusterError, GatewayError, ProvisionError};
pub use gateway::{AdminGateway, AdminSession, RetryPolicy};
pub use metrics::ClusterMetrics;
pub use model::{correlation_of, parse_result, JobRequest, JobResult, JobTemplate, ModelInstance};
pub use provisioner::{
    CapabilityHolder, InstanceGroup, ModelFactory, ProvisionedGroup, ProvisionedInstance,
    Provisioner,
};
pub use sturdy_store::SturdyRefStore;

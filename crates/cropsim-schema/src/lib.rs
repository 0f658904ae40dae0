//! ---
//! cs_section: "02-rpc-pipeline"
//! cs_subsection: "module"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "Generated Cap'n Proto types for climate data and the model cluster."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
//! Generated types for the interfaces cropsim talks to:
//!
//! - `common`: identity (`Identifiable`), durable references (`Persistent`)
//!   and the `StructuredText` envelope.
//! - `climate_data`: the service / simulation / scenario / realization /
//!   station / time-series hierarchy.
//! - `model` and `cluster_admin_service`: model instances and the admin
//!   master that provisions them.
//!
//! Modules live at the crate root because generated code refers to its
//! imports as `crate::<file>_capnp`.

#[allow(clippy::unwrap_used, clippy::expect_used, dead_code)]
pub mod common_capnp {
    include!(concat!(env!("OUT_DIR"), "/common_capnp.rs"));
}

#[allow(clippy::unwrap_used, clippy::expect_used, dead_code)]
pub mod date_capnp {
    include!(concat!(env!("OUT_DIR"), "/date_capnp.rs"));
}

#[allow(clippy::unwrap_used, clippy::expect_used, dead_code)]
pub mod geo_coord_capnp {
    include!(concat!(env!("OUT_DIR"), "/geo_coord_capnp.rs"));
}

#[allow(clippy::unwrap_used, clippy::expect_used, dead_code)]
pub mod climate_data_capnp {
    include!(concat!(env!("OUT_DIR"), "/climate_data_capnp.rs"));
}

#[allow(clippy::unwrap_used, clippy::expect_used, dead_code)]
pub mod model_capnp {
    include!(concat!(env!("OUT_DIR"), "/model_capnp.rs"));
}

#[allow(clippy::unwrap_used, clippy::expect_used, dead_code)]
pub mod cluster_admin_service_capnp {
    include!(concat!(env!("OUT_DIR"), "/cluster_admin_service_capnp.rs"));
}

pub use climate_data_capnp::climate_data;
pub use cluster_admin_service_capnp::cluster;
pub use common_capnp::{id_information, identifiable, persistent, structured_text};
pub use date_capnp::date;
pub use geo_coord_capnp::geo;
pub use model_capnp::model;

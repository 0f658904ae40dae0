//! ---
//! cs_section: "05-testharness"
//! cs_subsection: "module"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "Stub services shared by tests and the stub daemon."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
//! In-process stand-ins for the climate data service and the model cluster.
//!
//! Capabilities are `Rc`-based, so everything here runs on a
//! [`tokio::task::LocalSet`]; see [`run_local`].

use std::future::Future;

/// `Identifiable.info` for stubs carrying an `info: IdInfo` field.
macro_rules! identified {
    ($($server:ty),+ $(,)?) => {$(
        #[allow(refining_impl_trait)]
        impl cropsim_schema::identifiable::Server for $server {
            fn info(
                self: std::rc::Rc<Self>,
                _: cropsim_schema::identifiable::InfoParams,
                mut results: cropsim_schema::identifiable::InfoResults,
            ) -> capnp::capability::Promise<(), capnp::Error> {
                self.info.write(results.get());
                capnp::capability::Promise::ok(())
            }
        }
    )+};
}

pub mod bed;
pub mod climate;
pub mod cluster;

pub use bed::{StubServers, TestBed, ADMIN_ADDRESS, CLIMATE_ADDRESS};
pub use climate::{
    climate_service, ClimateFixture, ScenarioFixture, SimulationFixture, StationFixture,
    QUERY_POINTS,
};
pub use cluster::{ClusterBehaviour, Completion, StubCluster};

/// Drive `body` to completion on a fresh local task set.
pub async fn run_local<F: Future>(body: F) -> F::Output {
    tokio::task::LocalSet::new().run_until(body).await
}

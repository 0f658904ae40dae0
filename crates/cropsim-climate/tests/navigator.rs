//! ---
//! cs_section: "03-climate-data"
//! cs_subsection: "integration-tests"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "Navigator behaviour against a minimal in-process service."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
use std::rc::Rc;

use capnp::capability::Promise;
use cropsim_climate::{
    ClimateError, ClimateNavigator, DataService, Element, GeoCoord, NavigationPath, TimeSeries,
};
use cropsim_rpc::RemoteErrorKind;
use cropsim_schema::climate_data::{service, simulation, time_series};
use cropsim_schema::identifiable;

/// A service with one simulation that has no scenarios.
struct Hollow;

struct HollowSimulation;

/// A series that implements nothing beyond its interface id.
struct Mute;

impl identifiable::Server for Hollow {}
impl identifiable::Server for HollowSimulation {}
impl identifiable::Server for Mute {}
impl time_series::Server for Mute {}

#[allow(refining_impl_trait)]
impl service::Server for Hollow {
    fn get_available_simulations(
        self: Rc<Self>,
        _: service::GetAvailableSimulationsParams,
        mut results: service::GetAvailableSimulationsResults,
    ) -> Promise<(), capnp::Error> {
        let simulation: simulation::Client = capnp_rpc::new_client(HollowSimulation);
        results
            .get()
            .init_available_simulations(1)
            .set(0, simulation.client.hook);
        Promise::ok(())
    }
}

#[allow(refining_impl_trait)]
impl simulation::Server for HollowSimulation {
    fn scenarios(
        self: Rc<Self>,
        _: simulation::ScenariosParams,
        mut results: simulation::ScenariosResults,
    ) -> Promise<(), capnp::Error> {
        results.get().init_scenarios(0);
        Promise::ok(())
    }

    fn stations(
        self: Rc<Self>,
        _: simulation::StationsParams,
        mut results: simulation::StationsResults,
    ) -> Promise<(), capnp::Error> {
        results.get().init_stations(0);
        Promise::ok(())
    }
}

fn navigator() -> ClimateNavigator {
    ClimateNavigator::new(DataService::new(capnp_rpc::new_client(Hollow)))
}

#[tokio::test]
async fn empty_levels_yield_empty_results() {
    let nav = navigator();
    let coord = GeoCoord::lat_lon(46.51412, 12.81895).expect("coord");

    let found = nav
        .closest_along(&NavigationPath::default(), &coord)
        .await
        .expect("walk");
    assert!(found.is_empty());

    let missing_sim = NavigationPath {
        simulation: 3,
        ..NavigationPath::default()
    };
    assert!(nav
        .closest_along(&missing_sim, &coord)
        .await
        .expect("walk")
        .is_empty());
    assert!(nav.station_series(0, 0).await.expect("stations").is_empty());
}

#[tokio::test]
async fn unimplemented_methods_surface_as_rpc_errors() {
    let nav = navigator();
    let err = nav.service().info().wait().await.expect_err("no info");
    assert_eq!(err.remote_kind(), Some(RemoteErrorKind::Unimplemented));
}

#[tokio::test]
async fn calls_on_a_failed_subheader_fail_with_its_error() {
    let series = TimeSeries::new(capnp_rpc::new_client(Mute));
    let narrowed = series.subheader(&[Element::Tavg]).expect("known element");
    let err = narrowed.header().wait().await.expect_err("subheader failed");
    assert_eq!(err.remote_kind(), Some(RemoteErrorKind::Unimplemented));
}

#[tokio::test]
async fn unlisted_elements_cannot_be_requested() {
    let series = TimeSeries::new(capnp_rpc::new_client(Mute));
    let err = series
        .subheader(&[Element::Tavg, Element::Other(23)])
        .expect_err("no wire value");
    assert_eq!(err, ClimateError::UnknownElement(23));
}

//! ---
//! cs_section: "03-climate-data"
//! cs_subsection: "module"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "Climate data navigation crate exports."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
//! Navigation of a remote climate data service: simulations, scenarios,
//! realizations, stations and their time series.

pub mod error;
pub mod navigator;
pub mod types;
pub mod wire;

pub use error::ClimateError;
pub use navigator::{
    ClimateNavigator, DataService, NavigationPath, Realization, Scenario, Simulation, Station,
    TimeSeries, TimeSeriesSnapshot,
};
pub use types::{
    ensure_consistent, transpose, DateRange, Element, GeoCoord, IdInfo, LatLon, RealizationInfo,
    ScenarioInfo, SimulationInfo,
};

//! ---
//! cs_section: "03-climate-data"
//! cs_subsection: "module"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "Typed handles over the remote climate capability graph."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
//! Every handle wraps a generated capnp client, so a handle obtained from a
//! pipelined call can be used before the remote object is known to exist.
//! Calls on the same handle are independent and may run concurrently.
use capnp::capability::FromClientHook;
use capnp::capability_list;
use cropsim_rpc::{identify, CapKind, Connection, Promise, RpcResult};
use cropsim_schema::climate_data::{
    realization, scenario, service, simulation, station, time_series,
};
use tracing::debug;

use crate::error::ClimateError;
use crate::types::{
    ensure_consistent, DateRange, Element, GeoCoord, IdInfo, RealizationInfo, ScenarioInfo,
    SimulationInfo,
};
use crate::wire;

macro_rules! climate_handle {
    ($(#[$meta:meta])* $name:ident, $client:ty, $kind:expr) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name {
            client: $client,
        }

        impl $name {
            pub const KIND: CapKind = $kind;

            pub fn new(client: $client) -> Self {
                Self { client }
            }

            /// The generated client, for passing this capability along.
            pub fn client(&self) -> &$client {
                &self.client
            }

            /// `{id, name, description}` of this node.
            pub fn info(&self) -> Promise<IdInfo> {
                identify(&self.client.client)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name)).finish_non_exhaustive()
            }
        }
    };
}

climate_handle!(
    /// Bootstrap object of the climate data service.
    DataService,
    service::Client,
    CapKind::DataService
);
climate_handle!(Simulation, simulation::Client, CapKind::Simulation);
climate_handle!(Scenario, scenario::Client, CapKind::Scenario);
climate_handle!(Realization, realization::Client, CapKind::Realization);
climate_handle!(Station, station::Client, CapKind::Station);
climate_handle!(
    /// A remote dataset: ordered header plus row- and column-major data.
    TimeSeries,
    time_series::Client,
    CapKind::TimeSeries
);

fn wrap_all<C: FromClientHook, T>(
    caps: capability_list::Reader<'_, C>,
    wrap: fn(C) -> T,
) -> RpcResult<Vec<T>> {
    caps.iter().map(|cap| -> RpcResult<T> { Ok(wrap(cap?)) }).collect()
}

impl DataService {
    /// Bootstrap the data service over `conn`.
    pub fn bootstrap(conn: &Connection) -> Self {
        Self::new(conn.bootstrap())
    }

    pub fn simulations(&self) -> Promise<Vec<Simulation>> {
        let response = self.client.get_available_simulations_request().send().promise;
        Promise::new(async move {
            let response = response.await?;
            wrap_all(response.get()?.get_available_simulations()?, Simulation::new)
        })
    }
}

impl Simulation {
    pub fn scenarios(&self) -> Promise<Vec<Scenario>> {
        let response = self.client.scenarios_request().send().promise;
        Promise::new(async move {
            let response = response.await?;
            wrap_all(response.get()?.get_scenarios()?, Scenario::new)
        })
    }

    pub fn stations(&self) -> Promise<Vec<Station>> {
        let response = self.client.stations_request().send().promise;
        Promise::new(async move {
            let response = response.await?;
            wrap_all(response.get()?.get_stations()?, Station::new)
        })
    }
}

impl Scenario {
    pub fn simulation_info(&self) -> Promise<SimulationInfo> {
        let response = self.client.simulation_info_request().send().promise;
        Promise::new(async move { IdInfo::read(response.await?.get()?) })
    }

    pub fn realizations(&self) -> Promise<Vec<Realization>> {
        let response = self.client.realizations_request().send().promise;
        Promise::new(async move {
            let response = response.await?;
            wrap_all(response.get()?.get_realizations()?, Realization::new)
        })
    }
}

impl Realization {
    /// Time series nearest to `coord`, nearest first, as ordered remotely.
    pub fn closest_time_series_at(&self, coord: &GeoCoord) -> Promise<Vec<TimeSeries>> {
        let mut request = self.client.closest_time_series_at_request();
        wire::write_coord(request.get().init_geo_coord(), coord);
        let response = request.send().promise;
        Promise::new(async move {
            let response = response.await?;
            wrap_all(response.get()?.get_time_series()?, TimeSeries::new)
        })
    }
}

impl Station {
    pub fn geo_coord(&self) -> Promise<GeoCoord> {
        let response = self.client.geo_coord_request().send().promise;
        Promise::new(async move { wire::read_coord(response.await?.get()?) })
    }

    pub fn all_time_series(&self) -> Promise<Vec<TimeSeries>> {
        let response = self.client.all_time_series_request().send().promise;
        Promise::new(async move {
            let response = response.await?;
            wrap_all(response.get()?.get_all_time_series()?, TimeSeries::new)
        })
    }
}

impl TimeSeries {
    /// Column elements in order. Elements this build does not know come back
    /// as [`Element::Other`].
    pub fn header(&self) -> Promise<Vec<Element>> {
        let response = self.client.header_request().send().promise;
        Promise::new(async move {
            let response = response.await?;
            Ok(wire::read_header(response.get()?.get_header()?))
        })
    }

    /// Row-major values, one row per day.
    pub fn data(&self) -> Promise<Vec<Vec<f32>>> {
        let response = self.client.data_request().send().promise;
        Promise::new(async move {
            let response = response.await?;
            wire::read_matrix(response.get()?.get_data()?)
        })
    }

    /// Column-major values, one column per header element.
    pub fn data_t(&self) -> Promise<Vec<Vec<f32>>> {
        let response = self.client.data_t_request().send().promise;
        Promise::new(async move {
            let response = response.await?;
            wire::read_matrix(response.get()?.get_data()?)
        })
    }

    pub fn simulation_info(&self) -> Promise<SimulationInfo> {
        let response = self.client.simulation_info_request().send().promise;
        Promise::new(async move { IdInfo::read(response.await?.get()?) })
    }

    pub fn scenario_info(&self) -> Promise<ScenarioInfo> {
        let response = self.client.scenario_info_request().send().promise;
        Promise::new(async move { IdInfo::read(response.await?.get()?) })
    }

    pub fn realization_info(&self) -> Promise<RealizationInfo> {
        let response = self.client.realization_info_request().send().promise;
        Promise::new(async move { IdInfo::read(response.await?.get()?) })
    }

    pub fn range(&self) -> Promise<DateRange> {
        let response = self.client.range_request().send().promise;
        Promise::new(async move {
            let response = response.await?;
            let range = response.get()?;
            Ok(DateRange {
                start_date: wire::read_date(range.get_start_date()?)?,
                end_date: wire::read_date(range.get_end_date()?)?,
            })
        })
    }

    /// A time series restricted to `elements`. The returned handle is the
    /// pipelined answer: calls on it are sent right away, before the
    /// restricted series exists remotely.
    pub fn subheader(&self, elements: &[Element]) -> Result<TimeSeries, ClimateError> {
        let elements = wire::encode_header(elements)?;
        let mut request = self.client.subheader_request();
        wire::write_header(request.get().init_elements(elements.len() as u32), &elements);
        Ok(TimeSeries::new(request.send().pipeline.get_time_series()))
    }

    /// Fetch header, both projections and the three info records concurrently.
    /// Fails on the first error and rejects inconsistent projections.
    pub async fn snapshot(&self) -> Result<TimeSeriesSnapshot, ClimateError> {
        let (header, data, data_t, simulation, scenario, realization) = futures::try_join!(
            self.header(),
            self.data(),
            self.data_t(),
            self.simulation_info(),
            self.scenario_info(),
            self.realization_info(),
        )?;
        ensure_consistent(&data, &data_t)?;
        if !data_t.is_empty() && data_t.len() != header.len() {
            return Err(ClimateError::Inconsistent(format!(
                "header names {} elements but data has {} columns",
                header.len(),
                data_t.len()
            )));
        }
        Ok(TimeSeriesSnapshot {
            header,
            data,
            data_t,
            simulation,
            scenario,
            realization,
        })
    }
}

/// Everything a time series exposes, fetched at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeriesSnapshot {
    pub header: Vec<Element>,
    pub data: Vec<Vec<f32>>,
    pub data_t: Vec<Vec<f32>>,
    pub simulation: SimulationInfo,
    pub scenario: ScenarioInfo,
    pub realization: RealizationInfo,
}

impl TimeSeriesSnapshot {
    pub fn column(&self, element: Element) -> Option<&[f32]> {
        let index = self.header.iter().position(|e| *e == element)?;
        self.data_t.get(index).map(Vec::as_slice)
    }

    pub fn days(&self) -> usize {
        self.data.len()
    }
}

/// Which simulation, scenario and realization to follow when walking the
/// hierarchy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NavigationPath {
    pub simulation: usize,
    pub scenario: usize,
    pub realization: usize,
}

/// Walks the Simulation → Scenario → Realization hierarchy of a data service.
#[derive(Debug, Clone)]
pub struct ClimateNavigator {
    service: DataService,
}

impl ClimateNavigator {
    pub fn new(service: DataService) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &DataService {
        &self.service
    }

    /// Follow `path` and return the series closest to `coord`. A missing
    /// level yields an empty list.
    pub async fn closest_along(
        &self,
        path: &NavigationPath,
        coord: &GeoCoord,
    ) -> Result<Vec<TimeSeries>, ClimateError> {
        let Some(realization) = self.realization_at(path).await? else {
            return Ok(Vec::new());
        };
        Ok(realization.closest_time_series_at(coord).await?)
    }

    /// Resolve the realization `path` points at, if every level has it.
    pub async fn realization_at(
        &self,
        path: &NavigationPath,
    ) -> Result<Option<Realization>, ClimateError> {
        let simulations = self.service.simulations().await?;
        let Some(simulation) = pick(simulations, path.simulation, "simulation") else {
            return Ok(None);
        };
        let scenarios = simulation.scenarios().await?;
        let Some(scenario) = pick(scenarios, path.scenario, "scenario") else {
            return Ok(None);
        };
        let realizations = scenario.realizations().await?;
        Ok(pick(realizations, path.realization, "realization"))
    }

    /// All time series of the `station`-th station of the `simulation`-th
    /// simulation; empty when either does not exist.
    pub async fn station_series(
        &self,
        simulation: usize,
        station: usize,
    ) -> Result<Vec<TimeSeries>, ClimateError> {
        let simulations = self.service.simulations().await?;
        let Some(simulation) = pick(simulations, simulation, "simulation") else {
            return Ok(Vec::new());
        };
        let stations = simulation.stations().await?;
        let Some(station) = pick(stations, station, "station") else {
            return Ok(Vec::new());
        };
        Ok(station.all_time_series().await?)
    }
}

fn pick<T>(items: Vec<T>, index: usize, level: &str) -> Option<T> {
    let available = items.len();
    let picked = items.into_iter().nth(index);
    if picked.is_none() {
        debug!(%level, index, available, "navigation level has no such entry");
    }
    picked
}


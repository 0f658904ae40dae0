//! ---
//! cs_section: "05-testharness"
//! cs_subsection: "module"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "In-process climate data service built from a fixture."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
//! Every node of the hierarchy is built once, so repeated calls hand out the
//! same capabilities.
use std::rc::Rc;

use capnp::capability::{FromClientHook, Promise};
use capnp::capability_list;
use chrono::NaiveDate;
use cropsim_climate::wire;
use cropsim_climate::{transpose, ClimateError, DateRange, Element, GeoCoord, IdInfo};
use cropsim_rpc::RpcError;
use cropsim_schema::climate_data::{realization, scenario, service, simulation, station, time_series};
use tracing::debug;

/// Coordinates the climate client queries, each closest to the station of
/// the same index in [`ClimateFixture::sample`].
pub const QUERY_POINTS: [(f64, f64); 3] = [
    (46.51412, 12.81895),
    (51.18323, 2.84376),
    (44.10437, 26.55972),
];

#[derive(Debug, Clone, PartialEq)]
pub struct StationFixture {
    pub info: IdInfo,
    pub lat: f64,
    pub lon: f64,
}

impl StationFixture {
    pub fn new(id: &str, name: &str, lat: f64, lon: f64) -> Self {
        Self {
            info: IdInfo::new(id, name),
            lat,
            lon,
        }
    }

    pub fn coord(&self) -> Result<GeoCoord, ClimateError> {
        GeoCoord::lat_lon(self.lat, self.lon)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioFixture {
    pub info: IdInfo,
    pub realizations: Vec<IdInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationFixture {
    pub info: IdInfo,
    pub scenarios: Vec<ScenarioFixture>,
    pub stations: Vec<StationFixture>,
}

/// Shape and contents of a stub climate service.
#[derive(Debug, Clone, PartialEq)]
pub struct ClimateFixture {
    pub service: IdInfo,
    pub simulations: Vec<SimulationFixture>,
    pub header: Vec<Element>,
    pub range: DateRange,
}

impl ClimateFixture {
    /// Two simulations over four European stations, ten days of data each.
    pub fn sample() -> Self {
        let stations = vec![
            StationFixture::new("tolmezzo", "Tolmezzo", 46.40, 13.02),
            StationFixture::new("ostend", "Ostend", 51.23, 2.92),
            StationFixture::new("ruse", "Ruse", 43.85, 25.97),
            StationFixture::new("potsdam", "Potsdam", 52.38, 13.06),
        ];
        let realization = || vec![IdInfo::new("r1i1p1", "first realization")];
        Self {
            service: IdInfo::new("climate-stub", "Stub climate data service"),
            simulations: vec![
                SimulationFixture {
                    info: IdInfo::new("GFDL-CM3", "GFDL CM3"),
                    scenarios: vec![
                        ScenarioFixture {
                            info: IdInfo::new("rcp45", "RCP 4.5"),
                            realizations: realization(),
                        },
                        ScenarioFixture {
                            info: IdInfo::new("rcp85", "RCP 8.5"),
                            realizations: realization(),
                        },
                    ],
                    stations: stations.clone(),
                },
                SimulationFixture {
                    info: IdInfo::new("GISS-E2-R", "GISS E2-R"),
                    scenarios: vec![ScenarioFixture {
                        info: IdInfo::new("rcp45", "RCP 4.5"),
                        realizations: realization(),
                    }],
                    stations,
                },
            ],
            header: vec![Element::Tmin, Element::Tavg, Element::Tmax, Element::Precip],
            range: DateRange {
                start_date: NaiveDate::from_ymd_opt(1990, 1, 1).unwrap_or_default(),
                end_date: NaiveDate::from_ymd_opt(1990, 1, 10).unwrap_or_default(),
            },
        }
    }

    /// A service that offers no simulations at all.
    pub fn empty() -> Self {
        Self {
            simulations: Vec::new(),
            ..Self::sample()
        }
    }

    /// Row-major data of one station, shifted by `offset`.
    pub fn series_data(&self, station: usize, offset: f32) -> Vec<Vec<f32>> {
        let days = self.range.days().max(0) as usize;
        (0..days)
            .map(|day| {
                let base = station as f32 + day as f32 * 0.1 + offset;
                self.header
                    .iter()
                    .map(|element| match element {
                        Element::Tmin => base,
                        Element::Tavg => base + 5.0,
                        Element::Tmax => base + 10.0,
                        Element::Precip => (day % 3) as f32,
                        _ => 0.0,
                    })
                    .collect()
            })
            .collect()
    }
}

/// Build the whole service graph and return its bootstrap capability.
pub fn climate_service(fixture: &ClimateFixture) -> Result<service::Client, ClimateError> {
    let mut simulations = Vec::with_capacity(fixture.simulations.len());
    for simulation in &fixture.simulations {
        let coords = simulation
            .stations
            .iter()
            .map(StationFixture::coord)
            .collect::<Result<Vec<_>, _>>()?;
        let mut per_station: Vec<Vec<time_series::Client>> = vec![Vec::new(); coords.len()];
        let mut scenarios = Vec::with_capacity(simulation.scenarios.len());

        for (s, scenario) in simulation.scenarios.iter().enumerate() {
            let mut realizations = Vec::with_capacity(scenario.realizations.len());
            for (r, realization) in scenario.realizations.iter().enumerate() {
                let offset = s as f32 + r as f32 * 0.5;
                let mut series = Vec::with_capacity(coords.len());
                for (i, (station, coord)) in simulation.stations.iter().zip(&coords).enumerate() {
                    let client: time_series::Client = capnp_rpc::new_client(StubTimeSeries {
                        info: IdInfo::new(
                            format!(
                                "{}/{}/{}/{}",
                                simulation.info.id, scenario.info.id, realization.id, station.info.id
                            ),
                            station.info.name.clone(),
                        ),
                        header: fixture.header.clone(),
                        data: fixture.series_data(i, offset),
                        range: fixture.range,
                        simulation: simulation.info.clone(),
                        scenario: scenario.info.clone(),
                        realization: realization.clone(),
                    });
                    per_station[i].push(client.clone());
                    series.push((coord.clone(), client));
                }
                let client: realization::Client = capnp_rpc::new_client(StubRealization {
                    info: realization.clone(),
                    series,
                });
                realizations.push(client);
            }
            let client: scenario::Client = capnp_rpc::new_client(StubScenario {
                info: scenario.info.clone(),
                simulation: simulation.info.clone(),
                realizations,
            });
            scenarios.push(client);
        }

        let stations = simulation
            .stations
            .iter()
            .zip(coords)
            .zip(per_station)
            .map(|((station, coord), series)| -> station::Client {
                capnp_rpc::new_client(StubStation {
                    info: station.info.clone(),
                    coord,
                    series,
                })
            })
            .collect();
        let client: simulation::Client = capnp_rpc::new_client(StubSimulation {
            info: simulation.info.clone(),
            scenarios,
            stations,
        });
        simulations.push(client);
    }
    debug!(simulations = simulations.len(), "stub climate service built");
    Ok(capnp_rpc::new_client(StubDataService {
        info: fixture.service.clone(),
        simulations,
    }))
}

/// Fill a capability list builder, one entry per client.
pub(crate) fn set_caps<T: FromClientHook>(mut list: capability_list::Builder<'_, T>, clients: &[T]) {
    for (index, client) in clients.iter().enumerate() {
        list.set(index as u32, client.as_client_hook().add_ref());
    }
}

struct StubDataService {
    info: IdInfo,
    simulations: Vec<simulation::Client>,
}

#[allow(refining_impl_trait)]
impl service::Server for StubDataService {
    fn get_available_simulations(
        self: Rc<Self>,
        _: service::GetAvailableSimulationsParams,
        mut results: service::GetAvailableSimulationsResults,
    ) -> Promise<(), capnp::Error> {
        let count = self.simulations.len() as u32;
        set_caps(results.get().init_available_simulations(count), &self.simulations);
        Promise::ok(())
    }
}

struct StubSimulation {
    info: IdInfo,
    scenarios: Vec<scenario::Client>,
    stations: Vec<station::Client>,
}

#[allow(refining_impl_trait)]
impl simulation::Server for StubSimulation {
    fn scenarios(
        self: Rc<Self>,
        _: simulation::ScenariosParams,
        mut results: simulation::ScenariosResults,
    ) -> Promise<(), capnp::Error> {
        set_caps(results.get().init_scenarios(self.scenarios.len() as u32), &self.scenarios);
        Promise::ok(())
    }

    fn stations(
        self: Rc<Self>,
        _: simulation::StationsParams,
        mut results: simulation::StationsResults,
    ) -> Promise<(), capnp::Error> {
        set_caps(results.get().init_stations(self.stations.len() as u32), &self.stations);
        Promise::ok(())
    }
}

struct StubScenario {
    info: IdInfo,
    simulation: IdInfo,
    realizations: Vec<realization::Client>,
}

#[allow(refining_impl_trait)]
impl scenario::Server for StubScenario {
    fn simulation_info(
        self: Rc<Self>,
        _: scenario::SimulationInfoParams,
        mut results: scenario::SimulationInfoResults,
    ) -> Promise<(), capnp::Error> {
        self.simulation.write(results.get());
        Promise::ok(())
    }

    fn realizations(
        self: Rc<Self>,
        _: scenario::RealizationsParams,
        mut results: scenario::RealizationsResults,
    ) -> Promise<(), capnp::Error> {
        let count = self.realizations.len() as u32;
        set_caps(results.get().init_realizations(count), &self.realizations);
        Promise::ok(())
    }
}

struct StubRealization {
    info: IdInfo,
    series: Vec<(GeoCoord, time_series::Client)>,
}

#[allow(refining_impl_trait)]
impl realization::Server for StubRealization {
    fn closest_time_series_at(
        self: Rc<Self>,
        params: realization::ClosestTimeSeriesAtParams,
        mut results: realization::ClosestTimeSeriesAtResults,
    ) -> Promise<(), capnp::Error> {
        let coord = match params.get().and_then(|p| p.get_geo_coord()) {
            Ok(reader) => match wire::read_coord(reader) {
                Ok(coord) => coord,
                Err(err) => return Promise::err(err.into()),
            },
            Err(err) => return Promise::err(err),
        };
        let mut ranked: Vec<(f64, &time_series::Client)> = self
            .series
            .iter()
            .map(|(at, client)| (coord.distance_km(at), client))
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0));
        let ranked: Vec<time_series::Client> =
            ranked.into_iter().map(|(_, client)| client.clone()).collect();
        set_caps(results.get().init_time_series(ranked.len() as u32), &ranked);
        Promise::ok(())
    }
}

struct StubStation {
    info: IdInfo,
    coord: GeoCoord,
    series: Vec<time_series::Client>,
}

#[allow(refining_impl_trait)]
impl station::Server for StubStation {
    fn geo_coord(
        self: Rc<Self>,
        _: station::GeoCoordParams,
        mut results: station::GeoCoordResults,
    ) -> Promise<(), capnp::Error> {
        wire::write_coord(results.get(), &self.coord);
        Promise::ok(())
    }

    fn all_time_series(
        self: Rc<Self>,
        _: station::AllTimeSeriesParams,
        mut results: station::AllTimeSeriesResults,
    ) -> Promise<(), capnp::Error> {
        set_caps(results.get().init_all_time_series(self.series.len() as u32), &self.series);
        Promise::ok(())
    }
}

#[derive(Clone)]
struct StubTimeSeries {
    info: IdInfo,
    header: Vec<Element>,
    data: Vec<Vec<f32>>,
    range: DateRange,
    simulation: IdInfo,
    scenario: IdInfo,
    realization: IdInfo,
}

impl StubTimeSeries {
    fn project(&self, elements: &[Element]) -> Result<StubTimeSeries, RpcError> {
        let columns = elements
            .iter()
            .map(|element| {
                self.header.iter().position(|e| e == element).ok_or_else(|| {
                    RpcError::failed(format!("{} is not part of this time series", element))
                })
            })
            .collect::<Result<Vec<usize>, RpcError>>()?;
        let data = self
            .data
            .iter()
            .map(|row| columns.iter().map(|&c| row[c]).collect())
            .collect();
        Ok(StubTimeSeries {
            header: elements.to_vec(),
            data,
            ..self.clone()
        })
    }
}

#[allow(refining_impl_trait)]
impl time_series::Server for StubTimeSeries {
    fn range(
        self: Rc<Self>,
        _: time_series::RangeParams,
        mut results: time_series::RangeResults,
    ) -> Promise<(), capnp::Error> {
        let mut range = results.get();
        wire::write_date(range.reborrow().init_start_date(), self.range.start_date);
        wire::write_date(range.init_end_date(), self.range.end_date);
        Promise::ok(())
    }

    fn header(
        self: Rc<Self>,
        _: time_series::HeaderParams,
        mut results: time_series::HeaderResults,
    ) -> Promise<(), capnp::Error> {
        let header = match wire::encode_header(&self.header) {
            Ok(header) => header,
            Err(err) => return Promise::err(RpcError::from(err).into()),
        };
        wire::write_header(results.get().init_header(header.len() as u32), &header);
        Promise::ok(())
    }

    fn data(
        self: Rc<Self>,
        _: time_series::DataParams,
        mut results: time_series::DataResults,
    ) -> Promise<(), capnp::Error> {
        wire::write_matrix(results.get().init_data(self.data.len() as u32), &self.data);
        Promise::ok(())
    }

    fn data_t(
        self: Rc<Self>,
        _: time_series::DataTParams,
        mut results: time_series::DataTResults,
    ) -> Promise<(), capnp::Error> {
        let columns = transpose(&self.data);
        wire::write_matrix(results.get().init_data(columns.len() as u32), &columns);
        Promise::ok(())
    }

    fn subheader(
        self: Rc<Self>,
        params: time_series::SubheaderParams,
        mut results: time_series::SubheaderResults,
    ) -> Promise<(), capnp::Error> {
        let elements = match params.get().and_then(|p| p.get_elements()) {
            Ok(list) => wire::read_header(list),
            Err(err) => return Promise::err(err),
        };
        match self.project(&elements) {
            Ok(projected) => {
                let client: time_series::Client = capnp_rpc::new_client(projected);
                results.get().set_time_series(client);
                Promise::ok(())
            }
            Err(err) => Promise::err(err.into()),
        }
    }

    fn simulation_info(
        self: Rc<Self>,
        _: time_series::SimulationInfoParams,
        mut results: time_series::SimulationInfoResults,
    ) -> Promise<(), capnp::Error> {
        self.simulation.write(results.get());
        Promise::ok(())
    }

    fn scenario_info(
        self: Rc<Self>,
        _: time_series::ScenarioInfoParams,
        mut results: time_series::ScenarioInfoResults,
    ) -> Promise<(), capnp::Error> {
        self.scenario.write(results.get());
        Promise::ok(())
    }

    fn realization_info(
        self: Rc<Self>,
        _: time_series::RealizationInfoParams,
        mut results: time_series::RealizationInfoResults,
    ) -> Promise<(), capnp::Error> {
        self.realization.write(results.get());
        Promise::ok(())
    }
}

identified!(
    StubDataService,
    StubSimulation,
    StubScenario,
    StubRealization,
    StubStation,
    StubTimeSeries,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_data_matches_the_declared_range() {
        let fixture = ClimateFixture::sample();
        assert_eq!(fixture.range.days(), 10);
        let data = fixture.series_data(2, 0.0);
        assert_eq!(data.len(), 10);
        assert!(data.iter().all(|row| row.len() == fixture.header.len()));
        assert_eq!(data[0][1] - data[0][0], 5.0);
    }

    #[test]
    fn query_points_are_closest_to_their_station() {
        let fixture = ClimateFixture::sample();
        let stations = &fixture.simulations[0].stations;
        for (i, (lat, lon)) in QUERY_POINTS.iter().enumerate() {
            let query = GeoCoord::lat_lon(*lat, *lon).expect("coord");
            let nearest = stations
                .iter()
                .enumerate()
                .min_by(|a, b| {
                    let da = query.distance_km(&a.1.coord().expect("coord"));
                    let db = query.distance_km(&b.1.coord().expect("coord"));
                    da.total_cmp(&db)
                })
                .map(|(index, _)| index);
            assert_eq!(nearest, Some(i));
        }
    }

    #[tokio::test]
    async fn service_builds_from_the_sample() {
        crate::run_local(async {
            let service = climate_service(&ClimateFixture::sample()).expect("service");
            let info = cropsim_rpc::identify(&service.client).await.expect("info");
            assert_eq!(info.id, "climate-stub");
        })
        .await;
    }
}

//! ---
//! cs_section: "07-testing"
//! cs_subsection: "integration-tests"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "Climate navigation against the stub data service over in-memory connections."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
use cropsim_climate::{
    ClimateNavigator, DataService, Element, GeoCoord, NavigationPath,
};
use cropsim_testharness::{run_local, ClimateFixture, ClusterBehaviour, TestBed, CLIMATE_ADDRESS, QUERY_POINTS};

async fn navigator(bed: &TestBed) -> ClimateNavigator {
    let conn = bed.climate_connection().await.expect("climate connection");
    ClimateNavigator::new(DataService::bootstrap(&conn))
}

#[tokio::test]
async fn closest_series_come_in_non_decreasing_distance() {
    run_local(async {
        let bed = TestBed::new().expect("bed");
        let nav = navigator(&bed).await;
        let stations = &bed.climate().simulations[0].stations;

        for (index, (lat, lon)) in QUERY_POINTS.iter().enumerate() {
            let query = GeoCoord::lat_lon(*lat, *lon).expect("coord");
            let series = nav
                .closest_along(&NavigationPath::default(), &query)
                .await
                .expect("closest");
            assert_eq!(series.len(), stations.len());

            let mut distances = Vec::new();
            for ts in &series {
                let info = ts.info().await.expect("info");
                let station = stations
                    .iter()
                    .find(|s| s.info.name == info.name)
                    .expect("series names its station");
                distances.push(query.distance_km(&station.coord().expect("coord")));
            }
            assert!(distances.windows(2).all(|w| w[0] <= w[1]), "{distances:?}");

            let nearest = series[0].info().await.expect("info");
            assert_eq!(nearest.name, stations[index].info.name);
        }
    })
    .await;
}

#[tokio::test]
async fn header_is_idempotent() {
    run_local(async {
        let bed = TestBed::new().expect("bed");
        let nav = navigator(&bed).await;
        let query = GeoCoord::lat_lon(QUERY_POINTS[0].0, QUERY_POINTS[0].1).expect("coord");
        let series = nav
            .closest_along(&NavigationPath::default(), &query)
            .await
            .expect("closest");
        let ts = &series[0];

        let (first, second) = futures::try_join!(ts.header(), ts.header()).expect("headers");
        let third = ts.header().await.expect("header");
        assert_eq!(first, second);
        assert_eq!(second, third);
        assert_eq!(first, bed.climate().header);
    })
    .await;
}

#[tokio::test]
async fn walks_the_hierarchy_like_the_reference_client() {
    run_local(async {
        let bed = TestBed::new().expect("bed");
        let nav = navigator(&bed).await;
        let fixture = bed.climate();

        let sims = nav.service().simulations().await.expect("simulations");
        assert_eq!(sims.len(), 2);
        let scenarios = sims[0].scenarios().await.expect("scenarios");
        assert_eq!(scenarios.len(), 2);
        let sim_info = scenarios[0].simulation_info().await.expect("simulation info");
        assert_eq!(sim_info, fixture.simulations[0].info);

        let stations = sims[0].stations().await.expect("stations");
        let coord = stations[0].geo_coord().await.expect("geo coord");
        assert_eq!(coord, fixture.simulations[0].stations[0].coord().expect("coord"));

        let all = stations[0].all_time_series().await.expect("all series");
        assert_eq!(all.len(), 2, "one series per scenario realization");
        let (simulation, scenario, realization) = futures::try_join!(
            all[1].simulation_info(),
            all[1].scenario_info(),
            all[1].realization_info()
        )
        .expect("infos");
        assert_eq!(simulation.id, "GFDL-CM3");
        assert_eq!(scenario.id, "rcp85");
        assert_eq!(realization.id, "r1i1p1");

        let second = NavigationPath {
            simulation: 1,
            ..NavigationPath::default()
        };
        let query = GeoCoord::lat_lon(QUERY_POINTS[1].0, QUERY_POINTS[1].1).expect("coord");
        let series = nav.closest_along(&second, &query).await.expect("closest");
        let data = series[0].data().await.expect("data");
        assert_eq!(data.len() as i64, fixture.range.days());
    })
    .await;
}

#[tokio::test]
async fn snapshots_and_subheaders_agree() {
    run_local(async {
        let bed = TestBed::new().expect("bed");
        let nav = navigator(&bed).await;
        let station_series = nav.station_series(0, 2).await.expect("series");
        let ts = &station_series[0];

        let snapshot = ts.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.days(), 10);
        assert_eq!(snapshot.header, bed.climate().header);

        let tavg = ts.subheader(&[Element::Tavg]).expect("subheader");
        let projected = tavg.snapshot().await.expect("projected snapshot");
        assert_eq!(projected.header, vec![Element::Tavg]);
        assert_eq!(projected.column(Element::Tavg), snapshot.column(Element::Tavg));

        let range = ts.range().await.expect("range");
        assert_eq!(range, bed.climate().range);

        let err = ts
            .subheader(&[Element::Co2])
            .expect("subheader")
            .header()
            .await
            .expect_err("element not served");
        assert!(err.is_remote());
    })
    .await;
}

#[tokio::test]
async fn an_empty_service_yields_no_series() {
    run_local(async {
        let bed = TestBed::with(ClimateFixture::empty(), ClusterBehaviour::default()).expect("bed");
        let nav = navigator(&bed).await;
        let query = GeoCoord::lat_lon(QUERY_POINTS[2].0, QUERY_POINTS[2].1).expect("coord");
        let series = nav
            .closest_along(&NavigationPath::default(), &query)
            .await
            .expect("walk");
        assert!(series.is_empty());
        assert!(nav.station_series(0, 0).await.expect("walk").is_empty());
    })
    .await;
}

#[tokio::test]
async fn losing_the_connection_fails_outstanding_work() {
    run_local(async {
        let bed = TestBed::new().expect("bed");
        let conn = bed.climate_connection().await.expect("connection");
        let nav = ClimateNavigator::new(DataService::bootstrap(&conn));
        let sims = nav.service().simulations().await.expect("simulations");

        bed.network().sever(CLIMATE_ADDRESS);
        conn.closed().await;

        let err = sims[0].scenarios().await.expect_err("connection is gone");
        assert!(err.is_transport(), "{err}");
        assert!(conn.is_closed());
    })
    .await;
}

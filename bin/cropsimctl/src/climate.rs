//! ---
//! cs_section: "06-binaries"
//! cs_subsection: "binary"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "`climate` subcommand: browse the climate data service."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use clap::Args;
use cropsim_climate::{ClimateNavigator, DataService, Element, GeoCoord, NavigationPath};
use cropsim_common::AppConfig;
use cropsim_rpc::connect;
use tracing::info;

use crate::common::ConfigArgs;

#[derive(Debug, Args)]
pub struct ClimateArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
    /// Simulation to follow, by position.
    #[arg(long, default_value_t = 0)]
    pub simulation: usize,
    #[arg(long, default_value_t = 0)]
    pub scenario: usize,
    #[arg(long, default_value_t = 0)]
    pub realization: usize,
    /// Also fetch the full data of the closest series.
    #[arg(long)]
    pub snapshot: bool,
}

pub async fn run(args: ClimateArgs, config: &AppConfig) -> Result<()> {
    let address = &config.endpoints.climate_data_service;
    let conn = connect(address)
        .await
        .with_context(|| format!("connecting to climate data service {}", address))?;
    let navigator = ClimateNavigator::new(DataService::bootstrap(&conn));
    let coord = GeoCoord::lat_lon(config.climate.latitude, config.climate.longitude)?;
    let path = NavigationPath {
        simulation: args.simulation,
        scenario: args.scenario,
        realization: args.realization,
    };

    let simulations = navigator.service().simulations().await?;
    println!("simulations: {}", simulations.len());

    let series = navigator.closest_along(&path, &coord).await?;
    info!(%coord, found = series.len(), "closest time series resolved");
    match series.first() {
        None => println!("no time series along {:?} at {}", path, coord),
        Some(closest) => {
            let (info, header, range) =
                futures::try_join!(closest.info(), closest.header(), closest.range())?;
            let header: Vec<String> = header.iter().map(Element::to_string).collect();
            println!("closest series: {} ({})", info.id, info.name);
            println!("  elements: {}", header.join(", "));
            println!(
                "  range: {} .. {} ({} days)",
                range.start_date,
                range.end_date,
                range.days()
            );
            if args.snapshot {
                let snapshot = closest.snapshot().await?;
                println!(
                    "  {} / {} / {}",
                    snapshot.simulation.id, snapshot.scenario.id, snapshot.realization.id
                );
                if let Some(tavg) = snapshot.column(Element::Tavg) {
                    let mean = tavg.iter().sum::<f32>() / tavg.len().max(1) as f32;
                    println!("  mean tavg: {:.2}", mean);
                }
            }
        }
    }

    let at_first_station = navigator.station_series(args.simulation, 0).await?;
    println!("series at first station: {}", at_first_station.len());

    conn.close("climate query finished");
    Ok(())
}

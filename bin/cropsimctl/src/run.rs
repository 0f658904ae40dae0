//! ---
//! cs_section: "06-binaries"
//! cs_subsection: "binary"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "`run` subcommand: dispatch a job batch end to end."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::Args;
use cropsim_climate::{ClimateNavigator, DataService, GeoCoord, NavigationPath};
use cropsim_cluster::{
    BatchOutcome, ClusterError, ClusterMetrics, DispatchOptions, Dispatcher, JobTemplate,
    ProvisionedGroup, Provisioner, SturdyRefStore,
};
use cropsim_common::{new_registry, render_registry, AppConfig};
use cropsim_climate::TimeSeries;
use cropsim_rpc::{connect, CapKind, Connection};
use cropsim_schema::climate_data::time_series;
use serde_json::json;
use tracing::{info, warn};

use crate::common::{connect_admin, first_factory, ConfigArgs};

#[derive(Debug, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
    /// File holding named sturdy refs.
    #[arg(long, value_name = "FILE", default_value = "cropsim-refs.json")]
    pub store: PathBuf,
    /// Reuse the instances stored under this name instead of provisioning.
    #[arg(long, value_name = "NAME")]
    pub restore: Option<String>,
    /// Keep the provisioned instances and store their sturdy ref under NAME.
    #[arg(long, value_name = "NAME")]
    pub keep_as: Option<String>,
    /// Run without a climate time series.
    #[arg(long)]
    pub no_climate: bool,
    /// Print the metrics registry after the batch.
    #[arg(long)]
    pub print_metrics: bool,
}

pub async fn run(args: RunArgs, config: &AppConfig) -> Result<()> {
    let registry = new_registry();
    let metrics = ClusterMetrics::new(registry.clone())?;
    let field = &config.dispatch.correlation_field;

    let mut template = match &config.dispatch.env_template {
        Some(path) => JobTemplate::from_file(path, field)?,
        None => JobTemplate::new(json!({ "debugMode": false }), field.as_str())?,
    };
    let climate = if args.no_climate {
        None
    } else {
        let (conn, series) = closest_series(config).await?;
        if let Some(series) = series {
            template = template.with_time_series(series);
        } else {
            warn!("no climate time series found; jobs run without one");
        }
        Some(conn)
    };

    let session = connect_admin(config, Some(metrics.clone())).await?;
    let factory = first_factory(&session).await?;
    let provisioner = Provisioner::new(factory).with_metrics(metrics.clone());
    let mut store = SturdyRefStore::load(&args.store)?;

    let (instances, provisioned) = match &args.restore {
        Some(name) => {
            let sturdy = store
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow!("no sturdy ref named '{}' in {}", name, args.store.display()))?;
            let instances = match sturdy.kind {
                CapKind::HolderGroup => provisioner.restore_group(&sturdy).await?.models(),
                _ => vec![provisioner.restore(&sturdy).await?.instance],
            };
            (instances, None)
        }
        None => {
            let group = provisioner
                .provision_many(config.dispatch.instances)
                .await
                .context("provisioning instances")?;
            (group.models(), Some(group))
        }
    };
    info!(instances = instances.len(), "instances ready");

    let dispatcher = Dispatcher::new(instances)
        .with_correlation_field(field.as_str())
        .with_metrics(metrics.clone());
    let jobs = template.numbered(config.dispatch.jobs);
    let result = dispatcher
        .run_batch(jobs, DispatchOptions::from_config(&config.dispatch))
        .await;
    let outcome = settle(result, provisioned, args.keep_as.as_deref(), &mut store).await?;
    report(&outcome);
    if args.print_metrics {
        print!("{}", render_registry(&registry)?);
    }
    session.connection.close("batch finished");
    if let Some(conn) = climate {
        conn.close("batch finished");
    }
    Ok(())
}

async fn closest_series(
    config: &AppConfig,
) -> Result<(Connection, Option<time_series::Client>)> {
    let address = &config.endpoints.climate_data_service;
    let conn = connect(address)
        .await
        .with_context(|| format!("connecting to climate data service {}", address))?;
    let navigator = ClimateNavigator::new(DataService::bootstrap(&conn));
    let coord = GeoCoord::lat_lon(config.climate.latitude, config.climate.longitude)?;
    let series = navigator
        .closest_along(&NavigationPath::default(), &coord)
        .await?;
    let closest = series.first().map(|ts| ts.client().clone());
    Ok((conn, closest))
}

/// Hand provisioned instances back, or keep them, whether or not the batch
/// succeeded.
async fn settle(
    result: Result<BatchOutcome, ClusterError>,
    provisioned: Option<ProvisionedGroup>,
    keep_as: Option<&str>,
    store: &mut SturdyRefStore,
) -> Result<BatchOutcome> {
    let err = match result {
        Ok(outcome) => {
            if let Some(group) = provisioned {
                finish(group, keep_as, store).await?;
            }
            return Ok(outcome);
        }
        Err(err) => err,
    };
    if let ClusterError::SessionLost { outcome, .. } = &err {
        report(outcome);
    }
    if let Some(group) = provisioned {
        if let Err(cleanup) = finish(group, keep_as, store).await {
            warn!(error = %cleanup, "cleanup after the failed batch did not complete");
        }
    }
    Err(match err {
        ClusterError::SessionLost { source, .. } => anyhow!("cluster connection lost: {}", source),
        other => other.into(),
    })
}

fn report(outcome: &BatchOutcome) {
    for result in &outcome.results {
        println!("{}", result.correlation_id);
    }
    for failure in &outcome.failures {
        eprintln!("failed: {}", failure);
    }
    println!(
        "{} results, {} empty, {} failed",
        outcome.results.len(),
        outcome.empty.len(),
        outcome.failures.len()
    );
}

/// Either keep the instances under a name or give them back.
async fn finish(
    group: ProvisionedGroup,
    keep_as: Option<&str>,
    store: &mut SturdyRefStore,
) -> Result<()> {
    match keep_as {
        Some(name) => {
            store.put(name, group.sturdy_ref.clone());
            store.save()?;
            println!("{} = {}", name, group.sturdy_ref);
        }
        None => {
            let releases = group
                .instances
                .iter()
                .map(|provisioned| provisioned.holder.release());
            for released in futures::future::join_all(releases).await {
                if let Err(err) = released {
                    warn!(error = %err, "releasing instance failed");
                }
            }
        }
    }
    Ok(())
}

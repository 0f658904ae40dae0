//! ---
//! cs_section: "06-binaries"
//! cs_subsection: "binary"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "Binary entrypoint serving the stub services."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use cropsim_common::{init_tracing, AppConfig, LogFormat};
use cropsim_testharness::{ClimateFixture, ClusterBehaviour, Completion, StubServers};
use tokio::signal;
use tracing::info;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Stub climate data service and model cluster",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file (logging section only)")]
    config: Option<PathBuf>,

    #[arg(long, default_value = "127.0.0.1:11001", help = "Climate data service listen address")]
    climate_listen: String,

    #[arg(long, default_value = "127.0.0.1:8000", help = "Cluster admin listen address")]
    admin_listen: String,

    #[arg(long, default_value_t = 8, help = "Instances the cluster hands out at once")]
    capacity: usize,

    #[arg(long, default_value_t = 0, help = "Delay before every job completes, in milliseconds")]
    job_delay_ms: u64,

    #[arg(long, value_enum, default_value_t = FixtureKind::Sample, help = "Climate data to serve")]
    fixture: FixtureKind,

    #[arg(long, value_enum, help = "Override the log format")]
    log_format: Option<CliLogFormat>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FixtureKind {
    Sample,
    Empty,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliLogFormat {
    Pretty,
    Json,
}

impl From<CliLogFormat> for LogFormat {
    fn from(value: CliLogFormat) -> Self {
        match value {
            CliLogFormat::Pretty => LogFormat::Pretty,
            CliLogFormat::Json => LogFormat::StructuredJson,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tokio::task::LocalSet::new().run_until(serve_stubs(cli)).await
}

async fn serve_stubs(cli: Cli) -> Result<()> {
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    let mut logging = AppConfig::load_with_source(&candidates)?.config.logging;
    if let Some(format) = cli.log_format {
        logging.format = format.into();
    }
    init_tracing("cropsim-stubd", &logging)?;

    let fixture = match cli.fixture {
        FixtureKind::Sample => ClimateFixture::sample(),
        FixtureKind::Empty => ClimateFixture::empty(),
    };
    let completion = match cli.job_delay_ms {
        0 => Completion::Immediate,
        ms => Completion::Fixed(Duration::from_millis(ms)),
    };
    let behaviour = ClusterBehaviour::default()
        .with_capacity(cli.capacity)
        .with_completion(completion);

    let servers = StubServers::spawn(&cli.climate_listen, &cli.admin_listen, &fixture, behaviour).await?;
    info!(
        climate = %servers.climate,
        admin = %servers.admin,
        capacity = cli.capacity,
        "stub daemon running; waiting for termination signal"
    );

    signal::ctrl_c().await?;
    info!(runs = servers.cluster().runs(), "ctrl-c received; shutting down");
    servers.shutdown().await
}

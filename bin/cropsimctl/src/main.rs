//! ---
//! cs_section: "06-binaries"
//! cs_subsection: "binary"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "Operator CLI entrypoint."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
use anyhow::Result;
use clap::{Parser, Subcommand};
use cropsim_common::logging::init_tracing;

mod climate;
mod common;
mod provision;
mod run;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "cropsim operator utility",
    long_about = "Browse a climate data service, provision model instances on a \
                  cluster and run job batches against them. Trailing key=value \
                  arguments override the configuration file."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Walk the climate hierarchy and show the closest time series")]
    Climate(climate::ClimateArgs),
    #[command(about = "Provision model instances and store their sturdy refs")]
    Provision(provision::ProvisionArgs),
    #[command(about = "Dispatch a batch of jobs and collect the results")]
    Run(run::RunArgs),
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tokio::task::LocalSet::new().run_until(dispatch()).await
}

async fn dispatch() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.command {
        Commands::Climate(args) => args.config.load()?,
        Commands::Provision(args) => args.config.load()?,
        Commands::Run(args) => args.config.load()?,
    };
    init_tracing("cropsimctl", &config.logging)?;

    match cli.command {
        Commands::Climate(args) => climate::run(args, &config).await,
        Commands::Provision(args) => provision::run(args, &config).await,
        Commands::Run(args) => run::run(args, &config).await,
    }
}

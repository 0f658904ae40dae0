//! ---
//! cs_section: "06-binaries"
//! cs_subsection: "binary"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "`provision` subcommand: obtain instances and persist their sturdy refs."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use cropsim_cluster::{Provisioner, SturdyRefStore};
use cropsim_common::AppConfig;

use crate::common::{connect_admin, first_factory, ConfigArgs};

#[derive(Debug, Args)]
pub struct ProvisionArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
    /// Instances to provision; more than one is requested as a group.
    #[arg(long, default_value_t = 1)]
    pub count: usize,
    /// File holding named sturdy refs.
    #[arg(long, value_name = "FILE", default_value = "cropsim-refs.json")]
    pub store: PathBuf,
    /// Name to store the sturdy ref under.
    #[arg(long, default_value = "default")]
    pub name: String,
}

pub async fn run(args: ProvisionArgs, config: &AppConfig) -> Result<()> {
    let session = connect_admin(config, None).await?;
    let factory = first_factory(&session).await?;
    println!("model: {}", factory.model_id().await?);

    let provisioner = Provisioner::new(factory);
    let sturdy_ref = if args.count == 1 {
        provisioner.provision().await?.sturdy_ref
    } else {
        let group = provisioner.provision_many(args.count).await?;
        println!("provisioned {} instances", group.instances.len());
        group.sturdy_ref
    };

    let mut store = SturdyRefStore::load(&args.store)?;
    if let Some(previous) = store.put(args.name.clone(), sturdy_ref.clone()) {
        eprintln!("replacing {} ({})", args.name, previous);
    }
    store.save()?;
    println!("{} = {}", args.name, sturdy_ref);

    session.connection.close("provisioning finished");
    Ok(())
}

//! ---
//! cs_section: "06-binaries"
//! cs_subsection: "binary"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "Configuration loading and cluster connection helpers shared by the CLI commands."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{bail, Context, Result};
use clap::Args;
use cropsim_cluster::{AdminGateway, AdminSession, ClusterMetrics, ModelFactory, RetryPolicy};
use cropsim_common::AppConfig;
use cropsim_rpc::TcpConnector;
use tokio::sync::watch;
use tracing::{info, warn};

/// Configuration file plus `key=value` overrides.
#[derive(Debug, Args)]
pub struct ConfigArgs {
    /// Configuration file; `CROPSIM_CONFIG` takes precedence.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
    /// Overrides such as `admin_master_address=host:8000 jobs=50`.
    #[arg(value_name = "KEY=VALUE")]
    pub overrides: Vec<String>,
}

impl ConfigArgs {
    pub fn load(&self) -> Result<AppConfig> {
        let mut candidates = Vec::new();
        if let Some(path) = &self.config {
            candidates.push(path.clone());
        }
        candidates.push(PathBuf::from("configs/cropsim.toml"));

        let loaded = AppConfig::load_with_source(&candidates)?;
        let mut config = loaded.config;
        let ignored = config
            .apply_overrides(&self.overrides)
            .context("applying command line overrides")?;
        if !ignored.is_empty() {
            eprintln!("ignored unknown overrides: {}", ignored.join(", "));
        }
        if let Some(source) = loaded.source {
            eprintln!("configuration: {}", source.display());
        }
        Ok(config)
    }
}

/// A receiver that flips to true on ctrl-c.
pub fn cancel_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("ctrl-c received; cancelling");
            let _ = tx.send(true);
        }
    });
    rx
}

/// Reach the admin master with the configured retry policy.
pub async fn connect_admin(
    config: &AppConfig,
    metrics: Option<ClusterMetrics>,
) -> Result<AdminSession> {
    let mut gateway = AdminGateway::new(
        Rc::new(TcpConnector::default()),
        RetryPolicy::from_config(&config.gateway),
    );
    if let Some(metrics) = metrics {
        gateway = gateway.with_metrics(metrics);
    }
    let address = &config.endpoints.admin_master;
    let session = gateway
        .connect(address, Some(cancel_on_ctrl_c()))
        .await
        .with_context(|| format!("connecting to admin master {}", address))?;
    info!(%address, attempts = session.attempts, "connected to admin master");
    Ok(session)
}

/// The first factory the cluster offers.
pub async fn first_factory(session: &AdminSession) -> Result<ModelFactory> {
    let mut factories = session
        .admin
        .available_models()
        .await
        .context("listing available models")?;
    if factories.is_empty() {
        bail!("admin master offers no model factories");
    }
    Ok(factories.remove(0))
}

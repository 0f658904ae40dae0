//! ---
//! cs_section: "05-testharness"
//! cs_subsection: "module"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "Test beds wiring the stubs onto an in-memory network or TCP listeners."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::rc::Rc;

use anyhow::{Context, Result};
use cropsim_rpc::{serve, Connection, Connector, MemoryNetwork, RpcResult};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::climate::{climate_service, ClimateFixture};
use crate::cluster::{ClusterBehaviour, StubCluster};

pub const CLIMATE_ADDRESS: &str = "climate.stub:11001";
pub const ADMIN_ADDRESS: &str = "admin.stub:8000";

/// Both stubs registered on one in-memory network.
#[derive(Debug, Clone)]
pub struct TestBed {
    network: MemoryNetwork,
    climate: ClimateFixture,
    cluster: StubCluster,
}

impl TestBed {
    pub fn new() -> Result<Self> {
        Self::with(ClimateFixture::sample(), ClusterBehaviour::default())
    }

    pub fn with(climate: ClimateFixture, behaviour: ClusterBehaviour) -> Result<Self> {
        let network = MemoryNetwork::new();
        let service = climate_service(&climate).context("building stub climate service")?;
        let cluster = StubCluster::new(behaviour);
        network.register(CLIMATE_ADDRESS, service.client);
        network.register(ADMIN_ADDRESS, cluster.admin().client);
        Ok(Self {
            network,
            climate,
            cluster,
        })
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    pub fn connector(&self) -> Rc<dyn Connector> {
        Rc::new(self.network.clone())
    }

    pub fn climate(&self) -> &ClimateFixture {
        &self.climate
    }

    pub fn cluster(&self) -> &StubCluster {
        &self.cluster
    }

    pub async fn climate_connection(&self) -> RpcResult<Connection> {
        self.network.connect(CLIMATE_ADDRESS).await
    }

    pub async fn admin_connection(&self) -> RpcResult<Connection> {
        self.network.connect(ADMIN_ADDRESS).await
    }
}

/// Both stubs served over TCP until shut down. Must be spawned from within a
/// [`tokio::task::LocalSet`].
#[derive(Debug)]
pub struct StubServers {
    pub climate: SocketAddr,
    pub admin: SocketAddr,
    cluster: StubCluster,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<std::io::Result<()>>>,
}

impl StubServers {
    /// Bind both listeners (port 0 picks a free port) and start serving.
    pub async fn spawn(
        climate_bind: &str,
        admin_bind: &str,
        fixture: &ClimateFixture,
        behaviour: ClusterBehaviour,
    ) -> Result<Self> {
        let service = climate_service(fixture).context("building stub climate service")?;
        let cluster = StubCluster::new(behaviour);

        let climate_listener = TcpListener::bind(climate_bind)
            .await
            .with_context(|| format!("binding climate stub to {}", climate_bind))?;
        let admin_listener = TcpListener::bind(admin_bind)
            .await
            .with_context(|| format!("binding cluster stub to {}", admin_bind))?;
        let climate = climate_listener.local_addr()?;
        let admin = admin_listener.local_addr()?;

        let (shutdown, signal) = watch::channel(false);
        let tasks = vec![
            tokio::task::spawn_local(serve(climate_listener, service.client, signal.clone())),
            tokio::task::spawn_local(serve(admin_listener, cluster.admin().client, signal)),
        ];
        info!(%climate, %admin, "stub services listening");
        Ok(Self {
            climate,
            admin,
            cluster,
            shutdown,
            tasks,
        })
    }

    pub fn cluster(&self) -> &StubCluster {
        &self.cluster
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            task.await.context("stub server task panicked")??;
        }
        info!("stub services stopped");
        Ok(())
    }
}

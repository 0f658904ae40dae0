//! ---
//! cs_section: "04-cluster"
//! cs_subsection: "module"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "Cluster admin/master handle."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
use cropsim_rpc::{identify, CapKind, Connection, IdInfo, Promise, RpcResult};
use cropsim_schema::cluster::admin_master;

use crate::provisioner::ModelFactory;

/// Entry point of the compute cluster.
#[derive(Clone)]
pub struct AdminMaster {
    client: admin_master::Client,
}

impl AdminMaster {
    pub const KIND: CapKind = CapKind::AdminMaster;

    pub fn new(client: admin_master::Client) -> Self {
        Self { client }
    }

    pub fn bootstrap(conn: &Connection) -> Self {
        Self::new(conn.bootstrap())
    }

    pub fn client(&self) -> &admin_master::Client {
        &self.client
    }

    pub fn info(&self) -> Promise<IdInfo> {
        identify(&self.client.client)
    }

    /// Factories of every model type the cluster can run.
    pub fn available_models(&self) -> Promise<Vec<ModelFactory>> {
        let response = self.client.available_models_request().send().promise;
        Promise::new(async move {
            let response = response.await?;
            response
                .get()?
                .get_factories()?
                .iter()
                .map(|factory| -> RpcResult<ModelFactory> { Ok(ModelFactory::new(factory?)) })
                .collect()
        })
    }
}

impl std::fmt::Debug for AdminMaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminMaster").finish_non_exhaustive()
    }
}

//! ---
//! cs_section: "04-cluster"
//! cs_subsection: "module"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "Model factories, capability holders and the instance provisioner."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
//! A factory hands out *holders*. A holder exposes the live instance through
//! `cap` and a durable token through `save`; the token can later be turned
//! back into the same holder with `restoreSturdyRef`, from any connection.
//!
//! Holder and instance are pipelined: `new_instance().cap().run(..)` puts all
//! three calls on the wire before the factory has answered the first.
use capnp::capability::RemotePromise;
use cropsim_rpc::{identify, save, CapKind, CapRef, IdInfo, Promise, PromisedCap, RpcResult, SturdyRef};
use cropsim_schema::cluster::{instance_group, instance_holder, model_instance_factory};
use cropsim_schema::model::env_instance;
use futures::future::try_join_all;
use tracing::{debug, info, warn};

use crate::error::ProvisionError;
use crate::metrics::ClusterMetrics;
use crate::model::ModelInstance;

/// Cluster-wide factory of one model type.
#[derive(Clone)]
pub struct ModelFactory {
    client: model_instance_factory::Client,
}

impl ModelFactory {
    pub const KIND: CapKind = CapKind::ModelFactory;

    pub fn new(client: model_instance_factory::Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &model_instance_factory::Client {
        &self.client
    }

    pub fn info(&self) -> Promise<IdInfo> {
        identify(&self.client.client)
    }

    pub fn model_id(&self) -> Promise<String> {
        let response = self.client.model_id_request().send().promise;
        Promise::new(async move { Ok(response.await?.get()?.get_id()?.to_str()?.to_owned()) })
    }

    /// Request one instance. The returned holder is usable immediately.
    pub fn new_instance(&self) -> CapabilityHolder {
        let remote = self.client.new_instance_request().send();
        CapabilityHolder::new(PromisedCap::new(
            remote.pipeline.get_instance(),
            Promise::completion(remote.promise),
        ))
    }

    /// Request `count` instances in one call.
    pub fn new_instances(&self, count: usize) -> Result<InstanceGroup, ProvisionError> {
        let wire_count = i16::try_from(count).map_err(|_| ProvisionError::InvalidCount(count))?;
        let mut request = self.client.new_instances_request();
        request.get().set_number_of_instances(wire_count);
        let remote = request.send();
        Ok(InstanceGroup::new(PromisedCap::new(
            remote.pipeline.get_instances(),
            Promise::completion(remote.promise),
        )))
    }

    fn restore(
        &self,
        sturdy: &SturdyRef,
    ) -> RemotePromise<model_instance_factory::restore_sturdy_ref_results::Owned> {
        let mut request = self.client.restore_sturdy_ref_request();
        request.get().set_sturdy_ref(&sturdy.token);
        request.send()
    }

    /// Exchange a holder token for the holder it was saved from.
    pub fn restore_holder(&self, sturdy: &SturdyRef) -> CapabilityHolder {
        let remote = self.restore(sturdy);
        let holder: instance_holder::Client = remote.pipeline.get_cap().get_as_capability();
        CapabilityHolder::new(PromisedCap::new(holder, Promise::completion(remote.promise)))
    }

    /// Exchange a group token for the group it was saved from.
    pub fn restore_group(&self, sturdy: &SturdyRef) -> InstanceGroup {
        let remote = self.restore(sturdy);
        let group: instance_group::Client = remote.pipeline.get_cap().get_as_capability();
        InstanceGroup::new(PromisedCap::new(group, Promise::completion(remote.promise)))
    }
}

impl std::fmt::Debug for ModelFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelFactory").finish_non_exhaustive()
    }
}

/// Wraps one provisioned instance.
#[derive(Debug, Clone)]
pub struct CapabilityHolder {
    cap: PromisedCap<instance_holder::Client>,
}

impl CapabilityHolder {
    pub const KIND: CapKind = CapKind::CapHolder;

    pub fn new(cap: PromisedCap<instance_holder::Client>) -> Self {
        Self { cap }
    }

    pub fn capability(&self) -> &PromisedCap<instance_holder::Client> {
        &self.cap
    }

    /// The live instance, pipelined onto the holder.
    pub fn cap(&self) -> ModelInstance {
        let remote = self.cap.client().cap_request().send();
        let instance: env_instance::Client = remote.pipeline.get_cap();
        ModelInstance::new(PromisedCap::new(instance, Promise::completion(remote.promise)))
    }

    /// A durable token restoring this holder.
    pub fn save(&self) -> Promise<SturdyRef> {
        save(&self.cap.client().client, Self::KIND)
    }

    /// Give the instance back to the cluster.
    pub fn release(&self) -> Promise<()> {
        Promise::completion(self.cap.client().release_request().send().promise)
    }
}

/// Holder of several instances provisioned together.
#[derive(Debug, Clone)]
pub struct InstanceGroup {
    cap: PromisedCap<instance_group::Client>,
}

impl InstanceGroup {
    pub const KIND: CapKind = CapKind::HolderGroup;

    pub fn new(cap: PromisedCap<instance_group::Client>) -> Self {
        Self { cap }
    }

    /// One holder per instance, in provisioning order.
    pub fn holders(&self) -> Promise<Vec<CapabilityHolder>> {
        let response = self.cap.client().cap_request().send().promise;
        Promise::new(async move {
            let response = response.await?;
            response
                .get()?
                .get_cap()?
                .iter()
                .map(|holder| -> RpcResult<CapabilityHolder> {
                    Ok(CapabilityHolder::new(PromisedCap::resolved(holder?)))
                })
                .collect()
        })
    }

    /// A durable token restoring the whole group.
    pub fn save(&self) -> Promise<SturdyRef> {
        save(&self.cap.client().client, Self::KIND)
    }

    /// Give every instance of the group back to the cluster.
    pub fn release(&self) -> Promise<()> {
        Promise::completion(self.cap.client().release_request().send().promise)
    }
}

/// An instance together with the token that restores it.
#[derive(Debug, Clone)]
pub struct ProvisionedInstance {
    pub holder: CapabilityHolder,
    pub instance: ModelInstance,
    pub sturdy_ref: SturdyRef,
}

/// Result of provisioning several instances in one request.
#[derive(Debug, Clone)]
pub struct ProvisionedGroup {
    pub sturdy_ref: SturdyRef,
    pub instances: Vec<ProvisionedInstance>,
}

impl ProvisionedGroup {
    pub fn models(&self) -> Vec<ModelInstance> {
        self.instances.iter().map(|p| p.instance.clone()).collect()
    }
}

/// Obtains model instances from a factory.
#[derive(Debug, Clone)]
pub struct Provisioner {
    factory: ModelFactory,
    metrics: Option<ClusterMetrics>,
}

impl Provisioner {
    pub fn new(factory: ModelFactory) -> Self {
        Self {
            factory,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ClusterMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn factory(&self) -> &ModelFactory {
        &self.factory
    }

    /// Provision one instance; `cap` and `save` are issued together.
    pub async fn provision(&self) -> Result<ProvisionedInstance, ProvisionError> {
        let holder = self.factory.new_instance();
        let provisioned = bind(holder).await.map_err(|err| {
            warn!(error = %err, "provisioning failed");
            err
        })?;
        info!(sturdy_ref = %provisioned.sturdy_ref, "instance provisioned");
        self.record(1);
        Ok(provisioned)
    }

    /// Provision `count` instances with a single factory request.
    pub async fn provision_many(&self, count: usize) -> Result<ProvisionedGroup, ProvisionError> {
        let group = self.factory.new_instances(count)?;
        let (holders, sturdy_ref) = futures::try_join!(group.holders(), group.save())?;
        let instances = try_join_all(holders.into_iter().map(bind)).await?;
        info!(
            requested = count,
            provisioned = instances.len(),
            sturdy_ref = %sturdy_ref,
            "instance group provisioned"
        );
        self.record(instances.len());
        Ok(ProvisionedGroup {
            sturdy_ref,
            instances,
        })
    }

    /// Reattach to a previously saved instance.
    pub async fn restore(&self, sturdy: &SturdyRef) -> Result<ProvisionedInstance, ProvisionError> {
        let holder = self.factory.restore_holder(sturdy);
        let instance = holder.cap();
        instance.capability().wait().await?;
        debug!(sturdy_ref = %sturdy, "instance restored");
        self.record(1);
        Ok(ProvisionedInstance {
            holder,
            instance,
            sturdy_ref: sturdy.clone(),
        })
    }

    /// Reattach to a previously saved group.
    pub async fn restore_group(&self, sturdy: &SturdyRef) -> Result<ProvisionedGroup, ProvisionError> {
        let group = self.factory.restore_group(sturdy);
        let holders = group.holders().await?;
        let instances = try_join_all(holders.into_iter().map(bind)).await?;
        self.record(instances.len());
        Ok(ProvisionedGroup {
            sturdy_ref: sturdy.clone(),
            instances,
        })
    }

    /// Use a live reference as-is; restore a durable one first.
    pub async fn attach(
        &self,
        reference: CapRef<env_instance::Client>,
    ) -> Result<ModelInstance, ProvisionError> {
        match reference {
            CapRef::Live(client) => Ok(ModelInstance::new(PromisedCap::resolved(client))),
            CapRef::Durable(sturdy) => Ok(self.restore(&sturdy).await?.instance),
        }
    }

    fn record(&self, count: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.record_provisioned(count);
        }
    }
}

async fn bind(holder: CapabilityHolder) -> Result<ProvisionedInstance, ProvisionError> {
    let instance = holder.cap();
    let (_, sturdy_ref) = futures::try_join!(instance.capability().wait(), holder.save())?;
    Ok(ProvisionedInstance {
        holder,
        instance,
        sturdy_ref,
    })
}

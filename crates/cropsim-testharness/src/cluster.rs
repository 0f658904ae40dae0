//! ---
//! cs_section: "05-testharness"
//! cs_subsection: "module"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "In-process model cluster: admin, factory, holders and an echo model."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
//! The echo model answers every job with its own environment plus a few
//! fields of its own, so callers can check which job a result belongs to.
//! Sturdy refs live in a registry shared by every connection the cluster
//! serves.
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};
use std::time::Duration;

use capnp::capability::Promise;
use cropsim_climate::TimeSeries;
use cropsim_cluster::DEFAULT_CORRELATION_FIELD;
use cropsim_rpc::IdInfo;
use cropsim_schema::cluster::{admin_master, instance_group, instance_holder, model_instance_factory};
use cropsim_schema::model::env_instance;
use cropsim_schema::persistent;
use serde_json::Value as JsonValue;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use crate::climate::set_caps;

/// When a job's result becomes available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Completion {
    #[default]
    Immediate,
    Fixed(Duration),
    /// Job `n` finishes after `step * (span - n)`, so higher ids finish first.
    Reversed { step: Duration, span: u32 },
}

impl Completion {
    fn delay_for(&self, correlation_id: &str) -> Duration {
        match *self {
            Completion::Immediate => Duration::ZERO,
            Completion::Fixed(delay) => delay,
            Completion::Reversed { step, span } => {
                let n = correlation_id.parse::<u32>().unwrap_or(0);
                step * span.saturating_sub(n)
            }
        }
    }
}

/// How the stub cluster behaves.
#[derive(Debug, Clone)]
pub struct ClusterBehaviour {
    pub model_id: String,
    /// Instances that may be out at the same time.
    pub capacity: usize,
    pub completion: Completion,
    pub correlation_field: String,
    /// Jobs answered with an application error.
    pub fail_ids: HashSet<String>,
    /// Jobs answered with an empty result.
    pub empty_ids: HashSet<String>,
    /// Jobs answered with text that is not JSON.
    pub garbled_ids: HashSet<String>,
    /// While this reads false, instance requests wait before being served.
    pub gate: Option<watch::Receiver<bool>>,
}

impl Default for ClusterBehaviour {
    fn default() -> Self {
        Self {
            model_id: "monica".to_owned(),
            capacity: 8,
            completion: Completion::Immediate,
            correlation_field: DEFAULT_CORRELATION_FIELD.to_owned(),
            fail_ids: HashSet::new(),
            empty_ids: HashSet::new(),
            garbled_ids: HashSet::new(),
            gate: None,
        }
    }
}

fn id_set(ids: &[&str]) -> HashSet<String> {
    ids.iter().map(|id| (*id).to_owned()).collect()
}

impl ClusterBehaviour {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_completion(mut self, completion: Completion) -> Self {
        self.completion = completion;
        self
    }

    pub fn failing(mut self, ids: &[&str]) -> Self {
        self.fail_ids = id_set(ids);
        self
    }

    pub fn empty_for(mut self, ids: &[&str]) -> Self {
        self.empty_ids = id_set(ids);
        self
    }

    pub fn garbled_for(mut self, ids: &[&str]) -> Self {
        self.garbled_ids = id_set(ids);
        self
    }

    /// Hold `newInstance` and `newInstances` until `gate` reads true.
    pub fn gated(mut self, gate: watch::Receiver<bool>) -> Self {
        self.gate = Some(gate);
        self
    }
}

struct ClusterState {
    behaviour: ClusterBehaviour,
    live: Cell<usize>,
    next_instance: Cell<usize>,
    runs: Cell<usize>,
    sturdy: RefCell<HashMap<String, capnp::capability::Client>>,
}

impl ClusterState {
    fn reserve(&self, count: usize) -> Result<(), capnp::Error> {
        let capacity = self.behaviour.capacity;
        let live = self.live.get();
        if live + count > capacity {
            return Err(capnp::Error::overloaded(format!(
                "{} of {} instances in use, {} requested",
                live, capacity, count
            )));
        }
        self.live.set(live + count);
        Ok(())
    }

    fn forget(&self, token: &str) {
        self.sturdy.borrow_mut().remove(token);
    }

    async fn opened(&self) -> Result<(), capnp::Error> {
        if let Some(mut gate) = self.behaviour.gate.clone() {
            gate.wait_for(|open| *open)
                .await
                .map_err(|_| capnp::Error::failed("cluster gate was dropped".into()))?;
        }
        Ok(())
    }
}

fn upgrade(state: &Weak<ClusterState>) -> Result<Rc<ClusterState>, capnp::Error> {
    state
        .upgrade()
        .ok_or_else(|| capnp::Error::failed("cluster has shut down".into()))
}

/// Handle to a running stub cluster.
#[derive(Clone)]
pub struct StubCluster {
    state: Rc<ClusterState>,
    admin: admin_master::Client,
}

impl StubCluster {
    pub fn new(behaviour: ClusterBehaviour) -> Self {
        let model_id = behaviour.model_id.clone();
        let state = Rc::new(ClusterState {
            behaviour,
            live: Cell::new(0),
            next_instance: Cell::new(0),
            runs: Cell::new(0),
            sturdy: RefCell::new(HashMap::new()),
        });
        let factory: model_instance_factory::Client = capnp_rpc::new_client(StubFactory {
            info: IdInfo::new(format!("{}-factory", model_id), format!("{} factory", model_id)),
            state: Rc::downgrade(&state),
        });
        let admin = capnp_rpc::new_client(StubAdmin {
            info: IdInfo::new("admin-stub", "Stub cluster admin"),
            factories: vec![factory],
        });
        Self { state, admin }
    }

    /// Bootstrap capability of the cluster.
    pub fn admin(&self) -> admin_master::Client {
        self.admin.clone()
    }

    pub fn behaviour(&self) -> &ClusterBehaviour {
        &self.state.behaviour
    }

    /// Jobs started so far.
    pub fn runs(&self) -> usize {
        self.state.runs.get()
    }

    pub fn live_instances(&self) -> usize {
        self.state.live.get()
    }

    pub fn saved_refs(&self) -> usize {
        self.state.sturdy.borrow().len()
    }

    /// Forget every sturdy ref, as a cluster restart would.
    pub fn forget_refs(&self) {
        self.state.sturdy.borrow_mut().clear();
    }
}

impl std::fmt::Debug for StubCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StubCluster")
            .field("behaviour", &self.state.behaviour)
            .field("live", &self.live_instances())
            .field("runs", &self.runs())
            .finish()
    }
}

struct StubAdmin {
    info: IdInfo,
    factories: Vec<model_instance_factory::Client>,
}

#[allow(refining_impl_trait)]
impl admin_master::Server for StubAdmin {
    fn available_models(
        self: Rc<Self>,
        _: admin_master::AvailableModelsParams,
        mut results: admin_master::AvailableModelsResults,
    ) -> Promise<(), capnp::Error> {
        set_caps(results.get().init_factories(self.factories.len() as u32), &self.factories);
        Promise::ok(())
    }
}

struct StubFactory {
    info: IdInfo,
    state: Weak<ClusterState>,
}

impl StubFactory {
    fn holder(&self, state: &ClusterState) -> instance_holder::Client {
        let instance = state.next_instance.get();
        state.next_instance.set(instance + 1);
        let model_id = &state.behaviour.model_id;
        let model: env_instance::Client = capnp_rpc::new_client(EchoModel {
            info: IdInfo::new(format!("{}-{}", model_id, instance), model_id.clone()),
            state: self.state.clone(),
            instance,
        });
        let token = Uuid::new_v4().to_string();
        let holder: instance_holder::Client = capnp_rpc::new_client(StubHolder {
            state: self.state.clone(),
            instance: model,
            token: RefCell::new(Some(token.clone())),
        });
        state.sturdy.borrow_mut().insert(token, holder.client.clone());
        debug!(instance, "instance handed out");
        holder
    }
}

#[allow(refining_impl_trait)]
impl model_instance_factory::Server for StubFactory {
    fn model_id(
        self: Rc<Self>,
        _: model_instance_factory::ModelIdParams,
        mut results: model_instance_factory::ModelIdResults,
    ) -> Promise<(), capnp::Error> {
        let state = match upgrade(&self.state) {
            Ok(state) => state,
            Err(err) => return Promise::err(err),
        };
        results.get().set_id(&state.behaviour.model_id);
        Promise::ok(())
    }

    fn new_instance(
        self: Rc<Self>,
        _: model_instance_factory::NewInstanceParams,
        mut results: model_instance_factory::NewInstanceResults,
    ) -> Promise<(), capnp::Error> {
        Promise::from_future(async move {
            let state = upgrade(&self.state)?;
            state.opened().await?;
            state.reserve(1)?;
            results.get().set_instance(self.holder(&state));
            Ok(())
        })
    }

    fn new_instances(
        self: Rc<Self>,
        params: model_instance_factory::NewInstancesParams,
        mut results: model_instance_factory::NewInstancesResults,
    ) -> Promise<(), capnp::Error> {
        Promise::from_future(async move {
            let state = upgrade(&self.state)?;
            let requested = params.get()?.get_number_of_instances();
            let count = usize::try_from(requested).map_err(|_| {
                capnp::Error::failed(format!("cannot provision {} instances", requested))
            })?;
            state.opened().await?;
            state.reserve(count)?;
            let holders: Vec<instance_holder::Client> =
                (0..count).map(|_| self.holder(&state)).collect();
            let token = Uuid::new_v4().to_string();
            let group: instance_group::Client = capnp_rpc::new_client(StubGroup {
                state: self.state.clone(),
                holders,
                token: RefCell::new(Some(token.clone())),
            });
            state.sturdy.borrow_mut().insert(token, group.client.clone());
            info!(count, "instance group handed out");
            results.get().set_instances(group);
            Ok(())
        })
    }

    fn restore_sturdy_ref(
        self: Rc<Self>,
        params: model_instance_factory::RestoreSturdyRefParams,
        mut results: model_instance_factory::RestoreSturdyRefResults,
    ) -> Promise<(), capnp::Error> {
        Promise::from_future(async move {
            let state = upgrade(&self.state)?;
            let token = params.get()?.get_sturdy_ref()?.to_str()?.to_owned();
            let client = state.sturdy.borrow().get(&token).cloned();
            match client {
                Some(client) => {
                    results.get().init_cap().set_as_capability(client.hook);
                    Ok(())
                }
                None => Err(capnp::Error::failed(format!("unknown sturdy ref {}", token))),
            }
        })
    }
}

fn saved(
    token: &RefCell<Option<String>>,
    mut results: persistent::SaveResults,
) -> Promise<(), capnp::Error> {
    match token.borrow().as_deref() {
        Some(token) => {
            results.get().set_sturdy_ref(token);
            Promise::ok(())
        }
        None => Promise::err(capnp::Error::failed("nothing to save".into())),
    }
}

struct StubHolder {
    state: Weak<ClusterState>,
    instance: env_instance::Client,
    token: RefCell<Option<String>>,
}

impl StubHolder {
    /// Returns the instance to the pool; later calls are no-ops.
    fn give_back(&self) -> Result<(), capnp::Error> {
        let Some(token) = self.token.borrow_mut().take() else {
            return Ok(());
        };
        let state = upgrade(&self.state)?;
        state.live.set(state.live.get().saturating_sub(1));
        state.forget(&token);
        Ok(())
    }
}

#[allow(refining_impl_trait)]
impl persistent::Server for StubHolder {
    fn save(
        self: Rc<Self>,
        _: persistent::SaveParams,
        results: persistent::SaveResults,
    ) -> Promise<(), capnp::Error> {
        saved(&self.token, results)
    }
}

#[allow(refining_impl_trait)]
impl instance_holder::Server for StubHolder {
    fn cap(
        self: Rc<Self>,
        _: instance_holder::CapParams,
        mut results: instance_holder::CapResults,
    ) -> Promise<(), capnp::Error> {
        if self.token.borrow().is_none() {
            return Promise::err(capnp::Error::failed("instance was released".into()));
        }
        results.get().set_cap(self.instance.clone());
        Promise::ok(())
    }

    fn release(
        self: Rc<Self>,
        _: instance_holder::ReleaseParams,
        _: instance_holder::ReleaseResults,
    ) -> Promise<(), capnp::Error> {
        match self.give_back() {
            Ok(()) => Promise::ok(()),
            Err(err) => Promise::err(err),
        }
    }
}

struct StubGroup {
    state: Weak<ClusterState>,
    holders: Vec<instance_holder::Client>,
    token: RefCell<Option<String>>,
}

#[allow(refining_impl_trait)]
impl persistent::Server for StubGroup {
    fn save(
        self: Rc<Self>,
        _: persistent::SaveParams,
        results: persistent::SaveResults,
    ) -> Promise<(), capnp::Error> {
        saved(&self.token, results)
    }
}

#[allow(refining_impl_trait)]
impl instance_group::Server for StubGroup {
    fn cap(
        self: Rc<Self>,
        _: instance_group::CapParams,
        mut results: instance_group::CapResults,
    ) -> Promise<(), capnp::Error> {
        set_caps(results.get().init_cap(self.holders.len() as u32), &self.holders);
        Promise::ok(())
    }

    fn release(
        self: Rc<Self>,
        _: instance_group::ReleaseParams,
        _: instance_group::ReleaseResults,
    ) -> Promise<(), capnp::Error> {
        let releases: Vec<_> = self
            .holders
            .iter()
            .map(|holder| holder.release_request().send().promise)
            .collect();
        Promise::from_future(async move {
            futures::future::try_join_all(releases).await?;
            if let Some(token) = self.token.borrow_mut().take() {
                upgrade(&self.state)?.forget(&token);
            }
            Ok(())
        })
    }
}

struct EchoModel {
    info: IdInfo,
    state: Weak<ClusterState>,
    instance: usize,
}

impl EchoModel {
    async fn run(
        &self,
        state: &ClusterState,
        env_text: &str,
        series: Option<TimeSeries>,
    ) -> Result<String, capnp::Error> {
        let behaviour = &state.behaviour;
        let mut env: JsonValue = serde_json::from_str(env_text)
            .map_err(|err| capnp::Error::failed(format!("environment is not JSON: {}", err)))?;
        let correlation_id = match env.get(&behaviour.correlation_field) {
            Some(JsonValue::String(id)) => id.clone(),
            Some(JsonValue::Number(id)) => id.to_string(),
            _ => String::new(),
        };

        let delay = behaviour.completion.delay_for(&correlation_id);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if behaviour.fail_ids.contains(&correlation_id) {
            return Err(capnp::Error::failed(format!(
                "model failed on job {}",
                correlation_id
            )));
        }
        if behaviour.empty_ids.contains(&correlation_id) {
            return Ok(String::new());
        }
        if behaviour.garbled_ids.contains(&correlation_id) {
            return Ok("{\"truncated\": ".to_owned());
        }

        let climate_elements = match series {
            Some(series) => Some(
                series
                    .header()
                    .await
                    .map_err(|err| {
                        capnp::Error::failed(format!("climate data unavailable: {}", err))
                    })?
                    .len(),
            ),
            None => None,
        };
        if let Some(fields) = env.as_object_mut() {
            fields.insert("modelId".to_owned(), behaviour.model_id.clone().into());
            fields.insert("instance".to_owned(), self.instance.into());
            if let Some(count) = climate_elements {
                fields.insert("climateElements".to_owned(), count.into());
            }
        }
        Ok(env.to_string())
    }
}

#[allow(refining_impl_trait)]
impl env_instance::Server for EchoModel {
    fn run(
        self: Rc<Self>,
        params: env_instance::RunParams,
        mut results: env_instance::RunResults,
    ) -> Promise<(), capnp::Error> {
        Promise::from_future(async move {
            let state = upgrade(&self.state)?;
            state.runs.set(state.runs.get() + 1);
            let params = params.get()?;
            let env_text = params.get_rest()?.get_value()?.to_str()?.to_owned();
            let series = if params.has_time_series() {
                Some(TimeSeries::new(params.get_time_series()?))
            } else {
                None
            };
            let value = self.run(&state, &env_text, series).await?;
            results.get().init_result().set_value(&value);
            Ok(())
        })
    }

    fn model_id(
        self: Rc<Self>,
        _: env_instance::ModelIdParams,
        mut results: env_instance::ModelIdResults,
    ) -> Promise<(), capnp::Error> {
        let state = match upgrade(&self.state) {
            Ok(state) => state,
            Err(err) => return Promise::err(err),
        };
        results.get().set_id(&state.behaviour.model_id);
        Promise::ok(())
    }
}

identified!(StubAdmin, StubFactory, EchoModel);

#[cfg(test)]
mod tests {
    use super::*;
    use cropsim_rpc::{RemoteErrorKind, RpcError};

    use crate::run_local;

    #[test]
    fn reversed_completion_finishes_high_ids_first() {
        let completion = Completion::Reversed {
            step: Duration::from_millis(10),
            span: 5,
        };
        assert_eq!(completion.delay_for("0"), Duration::from_millis(50));
        assert_eq!(completion.delay_for("4"), Duration::from_millis(10));
        assert_eq!(completion.delay_for("9"), Duration::ZERO);
        assert_eq!(Completion::Immediate.delay_for("3"), Duration::ZERO);
    }

    async fn first_factory(cluster: &StubCluster) -> model_instance_factory::Client {
        let reply = cluster
            .admin()
            .available_models_request()
            .send()
            .promise
            .await
            .expect("models");
        let factory = reply
            .get()
            .expect("results")
            .get_factories()
            .expect("factories")
            .get(0)
            .expect("factory");
        factory
    }

    #[tokio::test]
    async fn capacity_is_enforced_across_requests() {
        run_local(async {
            let cluster = StubCluster::new(ClusterBehaviour::default().with_capacity(2));
            let factory = first_factory(&cluster).await;

            let mut two = factory.new_instances_request();
            two.get().set_number_of_instances(2);
            two.send().promise.await.expect("two instances");
            assert_eq!(cluster.live_instances(), 2);
            assert_eq!(cluster.saved_refs(), 3);

            let err = factory
                .new_instance_request()
                .send()
                .promise
                .await
                .map(|_| ())
                .expect_err("full");
            assert_eq!(
                RpcError::from(err).remote_kind(),
                Some(RemoteErrorKind::Overloaded)
            );
        })
        .await;
    }

    #[tokio::test]
    async fn gated_factories_hold_requests_until_opened() {
        run_local(async {
            let (open, gate) = watch::channel(false);
            let cluster = StubCluster::new(ClusterBehaviour::default().gated(gate));
            let factory = first_factory(&cluster).await;

            let pending = factory.new_instance_request().send().promise;
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
            assert_eq!(cluster.live_instances(), 0);

            open.send(true).expect("gate");
            pending.await.expect("instance");
            assert_eq!(cluster.live_instances(), 1);
        })
        .await;
    }

    #[tokio::test]
    async fn released_holders_forget_their_sturdy_ref() {
        run_local(async {
            let cluster = StubCluster::new(ClusterBehaviour::default());
            let factory = first_factory(&cluster).await;
            let reply = factory.new_instance_request().send().promise.await.expect("instance");
            let holder = reply.get().expect("results").get_instance().expect("holder");
            assert_eq!(cluster.saved_refs(), 1);

            for _ in 0..2 {
                holder.release_request().send().promise.await.expect("release");
            }
            assert_eq!(cluster.live_instances(), 0);
            assert_eq!(cluster.saved_refs(), 0);
            assert!(holder.cap_request().send().promise.await.is_err());
        })
        .await;
    }
}

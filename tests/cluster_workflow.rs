//! ---
//! cs_section: "07-testing"
//! cs_subsection: "integration-tests"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "Gateway, provisioning and dispatch against the stub cluster."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
use std::collections::BTreeSet;
use std::time::Duration;

use cropsim_climate::{ClimateNavigator, DataService, GeoCoord, NavigationPath};
use cropsim_cluster::{
    AdminGateway, AdminSession, ClusterError, ClusterMetrics, DispatchOptions, Dispatcher,
    FailureKind, JobTemplate, ProvisionError, Provisioner, RetryPolicy, SturdyRefStore,
};
use cropsim_common::new_registry;
use cropsim_rpc::{join_settled, CapKind, CapRef};
use cropsim_testharness::{
    run_local, ClimateFixture, ClusterBehaviour, Completion, TestBed, ADMIN_ADDRESS, QUERY_POINTS,
};
use serde_json::json;

fn fast_policy() -> RetryPolicy {
    RetryPolicy::new(
        5,
        Duration::from_millis(5),
        Duration::from_millis(20),
        Duration::ZERO,
    )
}

async fn admin(bed: &TestBed) -> AdminSession {
    AdminGateway::new(bed.connector(), fast_policy())
        .connect(ADMIN_ADDRESS, None)
        .await
        .expect("admin session")
}

async fn open_provisioner(bed: &TestBed) -> (AdminSession, Provisioner) {
    let session = admin(bed).await;
    let mut factories = session.admin.available_models().await.expect("factories");
    assert_eq!(factories.len(), 1);
    let provisioner = Provisioner::new(factories.remove(0));
    (session, provisioner)
}

fn template() -> JobTemplate {
    JobTemplate::new(json!({"crop": "winter-wheat", "debugMode": false}), "customId")
        .expect("template")
}

fn bed(behaviour: ClusterBehaviour) -> TestBed {
    TestBed::with(ClimateFixture::sample(), behaviour).expect("bed")
}

#[tokio::test]
async fn gateway_binds_after_three_refused_attempts() {
    run_local(async {
        let bed = TestBed::new().expect("bed");
        bed.network().refuse_next(ADMIN_ADDRESS, 3);

        let session = admin(&bed).await;
        assert_eq!(session.attempts, 4);
        assert_eq!(bed.network().attempts(ADMIN_ADDRESS), 4);
        let factories = session.admin.available_models().await.expect("factories");
        assert_eq!(factories[0].model_id().await.expect("model id"), "monica");
    })
    .await;
}

#[tokio::test]
async fn restored_instance_behaves_like_the_original() {
    run_local(async {
        let bed = TestBed::new().expect("bed");
        let (session, provisioner) = open_provisioner(&bed).await;
        let original = provisioner.provision().await.expect("instance");
        let job = template().job("7");
        let first = original.instance.run(&job).await.expect("run");

        let (other_session, other) = open_provisioner(&bed).await;
        assert_ne!(other_session.connection.id(), session.connection.id());
        let restored = other.restore(&original.sturdy_ref).await.expect("restore");

        assert_eq!(
            restored.instance.model_id().await.expect("model id"),
            original.instance.model_id().await.expect("model id")
        );
        let again = restored.instance.run(&job).await.expect("run");
        assert_eq!(first, again);
        assert_eq!(bed.cluster().live_instances(), 1, "restoring does not provision");
    })
    .await;
}

#[tokio::test]
async fn best_effort_join_keeps_the_other_results_in_order() {
    run_local(async {
        let bed = bed(ClusterBehaviour::default().failing(&["2"]));
        let (_session, provisioner) = open_provisioner(&bed).await;
        let instance = provisioner.provision().await.expect("instance").instance;

        let template = template();
        let promises = (0..5).map(|i| instance.run(&template.job(i.to_string())));
        let settled = join_settled(promises).await;

        assert_eq!(settled.len(), 5);
        assert!(settled[2].as_ref().is_err_and(|err| err.is_remote()));
        let ids: Vec<String> = settled
            .into_iter()
            .filter_map(Result::ok)
            .map(|raw| cropsim_cluster::correlation_of(&raw, "customId").expect("id"))
            .collect();
        assert_eq!(ids, vec!["0", "1", "3", "4"]);
    })
    .await;
}

#[tokio::test]
async fn reversed_completion_still_yields_every_job_once() {
    run_local(async {
        let completion = Completion::Reversed {
            step: Duration::from_millis(15),
            span: 5,
        };
        let bed = bed(ClusterBehaviour::default().with_completion(completion));
        let (_session, provisioner) = open_provisioner(&bed).await;
        let instance = provisioner.provision().await.expect("instance").instance;

        let dispatcher = Dispatcher::new(vec![instance]);
        let pending = dispatcher.dispatch(template().numbered(5)).expect("dispatch");
        let outcome = dispatcher.collect(pending).await;

        assert!(outcome.is_clean());
        let ids: BTreeSet<String> = outcome.correlation_ids().into_iter().collect();
        let expected: BTreeSet<String> = (0..5).map(|i| i.to_string()).collect();
        assert_eq!(ids, expected);
        assert_eq!(outcome.results.len(), 5);
    })
    .await;
}

#[tokio::test]
async fn zero_instances_is_an_empty_group() {
    run_local(async {
        let bed = TestBed::new().expect("bed");
        let (_session, provisioner) = open_provisioner(&bed).await;

        let holders = provisioner
            .factory()
            .new_instances(0)
            .expect("group")
            .holders()
            .await
            .expect("holders");
        assert!(holders.is_empty());
        let group = provisioner.provision_many(0).await.expect("group");
        assert!(group.instances.is_empty());
        assert_eq!(group.sturdy_ref.kind, CapKind::HolderGroup);
        assert_eq!(bed.cluster().live_instances(), 0);
    })
    .await;
}

#[tokio::test]
async fn exhausted_capacity_is_not_a_transport_error() {
    run_local(async {
        let bed = bed(ClusterBehaviour::default().with_capacity(1));
        let (_session, provisioner) = open_provisioner(&bed).await;

        let first = provisioner.provision().await.expect("first");
        let err = provisioner.provision().await.expect_err("no capacity");
        assert!(matches!(err, ProvisionError::NoCapacity(_)), "{err}");
        let err = provisioner.provision_many(2).await.expect_err("no capacity");
        assert!(matches!(err, ProvisionError::NoCapacity(_)), "{err}");

        first.holder.release().await.expect("release");
        first.holder.release().await.expect("release again");
        assert_eq!(bed.cluster().live_instances(), 0);
        let err = first.holder.cap().capability().wait().await.expect_err("released");
        assert!(err.is_remote());
        provisioner.provision().await.expect("capacity is back");
    })
    .await;
}

#[tokio::test]
async fn dispatch_separates_empty_and_malformed_results() {
    run_local(async {
        let behaviour = ClusterBehaviour::default()
            .empty_for(&["1"])
            .garbled_for(&["3"])
            .failing(&["4"]);
        let bed = bed(behaviour);
        let (_session, provisioner) = open_provisioner(&bed).await;
        let group = provisioner.provision_many(2).await.expect("group");
        let metrics = ClusterMetrics::new(new_registry()).expect("metrics");

        let dispatcher = Dispatcher::new(group.models()).with_metrics(metrics.clone());
        let outcome = dispatcher
            .run_batch(template().numbered(6), DispatchOptions::default())
            .await
            .expect("batch");

        assert_eq!(outcome.correlation_ids(), vec!["0", "2", "5"]);
        assert_eq!(outcome.empty, vec!["1".to_owned()]);
        assert_eq!(outcome.failures.len(), 2);
        assert!(matches!(
            outcome.failures[0].kind,
            FailureKind::MalformedCorrelation(_)
        ));
        assert_eq!(outcome.failures[0].correlation_id, "3");
        assert!(matches!(outcome.failures[1].kind, FailureKind::Rpc(_)));
        assert_eq!(metrics.jobs("ok"), 3);
        assert_eq!(metrics.jobs("empty"), 1);
    })
    .await;
}

#[tokio::test]
async fn windows_cover_the_whole_batch() {
    run_local(async {
        let bed = TestBed::new().expect("bed");
        let (_session, provisioner) = open_provisioner(&bed).await;
        let group = provisioner.provision_many(3).await.expect("group");
        let dispatcher = Dispatcher::new(group.models());

        let outcome = dispatcher
            .run_batch(template().numbered(12), DispatchOptions::windowed(5))
            .await
            .expect("batch");
        assert_eq!(outcome.results.len(), 12);
        assert_eq!(bed.cluster().runs(), 12);

        let used: BTreeSet<i64> = outcome
            .results
            .iter()
            .map(|r| r.value["instance"].as_i64().expect("instance"))
            .collect();
        assert_eq!(used.len(), 3, "every instance got work");
    })
    .await;
}

#[tokio::test]
async fn climate_series_travel_to_the_model() {
    run_local(async {
        let bed = TestBed::new().expect("bed");
        let climate = bed.climate_connection().await.expect("climate");
        let navigator = ClimateNavigator::new(DataService::bootstrap(&climate));
        let query = GeoCoord::lat_lon(QUERY_POINTS[0].0, QUERY_POINTS[0].1).expect("coord");
        let series = navigator
            .closest_along(&NavigationPath::default(), &query)
            .await
            .expect("series");

        let (_session, provisioner) = open_provisioner(&bed).await;
        let instance = provisioner.provision().await.expect("instance").instance;
        let template = template().with_time_series(series[0].client().clone());

        let outcome = Dispatcher::new(vec![instance])
            .run_batch(template.numbered(3), DispatchOptions::default())
            .await
            .expect("batch");
        assert_eq!(outcome.results.len(), 3);
        for result in &outcome.results {
            assert_eq!(result.value["climateElements"], 4);
            assert_eq!(result.value["crop"], "winter-wheat");
        }
    })
    .await;
}

#[tokio::test]
async fn losing_the_cluster_mid_batch_keeps_partial_results() {
    run_local(async {
        let bed = bed(ClusterBehaviour::default().with_completion(Completion::Fixed(
            Duration::from_millis(300),
        )));
        let (session, provisioner) = open_provisioner(&bed).await;
        let group = provisioner.provision_many(2).await.expect("group");
        let dispatcher = Dispatcher::new(group.models());

        let network = bed.network().clone();
        tokio::task::spawn_local(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            network.sever(ADMIN_ADDRESS);
        });

        let err = dispatcher
            .run_batch(template().numbered(6), DispatchOptions::windowed(2))
            .await
            .expect_err("connection lost");
        match err {
            ClusterError::SessionLost { outcome, source } => {
                assert!(source.is_transport());
                assert!(outcome.results.is_empty());
                assert_eq!(outcome.failures.len(), 2, "only the first window was sent");
            }
            other => panic!("unexpected {other}"),
        }
        session.connection.closed().await;
    })
    .await;
}

#[tokio::test]
async fn stored_refs_restore_on_a_new_connection() {
    run_local(async {
        let bed = TestBed::new().expect("bed");
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("refs.json");

        let group_ref = {
            let (session, provisioner) = open_provisioner(&bed).await;
            let group = provisioner.provision_many(2).await.expect("group");
            let mut store = SturdyRefStore::load(&path).expect("store");
            store.put("batch", group.sturdy_ref.clone());
            store.put("single", group.instances[0].sturdy_ref.clone());
            store.save().expect("save");
            session.connection.close("done");
            group.sturdy_ref
        };

        let store = SturdyRefStore::load(&path).expect("reload");
        assert_eq!(store.get("batch"), Some(&group_ref));
        let (_session, provisioner) = open_provisioner(&bed).await;
        let restored = provisioner
            .restore_group(store.get("batch").expect("batch"))
            .await
            .expect("restore group");
        assert_eq!(restored.instances.len(), 2);

        let durable = provisioner
            .attach(CapRef::from(store.get("single").expect("single").clone()))
            .await
            .expect("attach durable");
        let live = provisioner
            .attach(CapRef::Live(
                restored.instances[1]
                    .instance
                    .capability()
                    .wait()
                    .await
                    .expect("live"),
            ))
            .await
            .expect("attach live");

        let outcome = Dispatcher::new(vec![durable, live])
            .run_batch(template().numbered(4), DispatchOptions::default())
            .await
            .expect("batch");
        assert_eq!(outcome.results.len(), 4);
        assert_eq!(bed.cluster().live_instances(), 2);
    })
    .await;
}

#[tokio::test]
async fn unknown_sturdy_refs_are_rejected_remotely() {
    run_local(async {
        let bed = TestBed::new().expect("bed");
        let (_session, provisioner) = open_provisioner(&bed).await;
        let bogus = cropsim_rpc::SturdyRef::new("not-a-token", CapKind::CapHolder);
        let err = provisioner.restore(&bogus).await.expect_err("unknown");
        assert!(matches!(err, ProvisionError::Remote(_)), "{err}");
    })
    .await;
}

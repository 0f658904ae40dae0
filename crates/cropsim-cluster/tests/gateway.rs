//! ---
//! cs_section: "04-cluster"
//! cs_subsection: "tests"
//! cs_type: "test"
//! cs_scope: "code"
//! cs_description: "Admin gateway retry, timeout and cancellation behaviour."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use capnp::capability::Promise;
use cropsim_cluster::{AdminGateway, ClusterMetrics, GatewayError, RetryPolicy};
use cropsim_common::new_registry;
use cropsim_rpc::{IdInfo, MemoryNetwork};
use cropsim_schema::cluster::admin_master;
use cropsim_schema::identifiable;
use tokio::sync::watch;
use tokio::task::LocalSet;

const ADMIN: &str = "cluster-admin:9000";

struct EmptyAdmin;

#[allow(refining_impl_trait)]
impl identifiable::Server for EmptyAdmin {
    fn info(
        self: Rc<Self>,
        _: identifiable::InfoParams,
        mut results: identifiable::InfoResults,
    ) -> Promise<(), capnp::Error> {
        IdInfo::new("admin", "empty admin").write(results.get());
        Promise::ok(())
    }
}

#[allow(refining_impl_trait)]
impl admin_master::Server for EmptyAdmin {
    fn available_models(
        self: Rc<Self>,
        _: admin_master::AvailableModelsParams,
        mut results: admin_master::AvailableModelsResults,
    ) -> Promise<(), capnp::Error> {
        results.get().init_factories(0);
        Promise::ok(())
    }
}

/// Admin that accepts connections but cannot identify itself.
struct Anonymous;

impl identifiable::Server for Anonymous {}
impl admin_master::Server for Anonymous {}

fn network() -> MemoryNetwork {
    let network = MemoryNetwork::new();
    let admin: admin_master::Client = capnp_rpc::new_client(EmptyAdmin);
    network.register(ADMIN, admin.client);
    network
}

async fn local<F: Future>(body: F) -> F::Output {
    LocalSet::new().run_until(body).await
}

fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(
        max_attempts,
        Duration::from_millis(100),
        Duration::from_secs(1),
        Duration::from_millis(20),
    )
}

#[tokio::test(start_paused = true)]
async fn binds_after_three_refusals() {
    local(async {
        let network = network();
        network.refuse_next(ADMIN, 3);
        let metrics = ClusterMetrics::new(new_registry()).expect("metrics");
        let gateway = AdminGateway::new(Rc::new(network.clone()), policy(5))
            .with_seed(42)
            .with_metrics(metrics.clone());

        let session = gateway.connect(ADMIN, None).await.expect("bound");
        assert_eq!(session.attempts, 4);
        assert_eq!(session.info.name, "empty admin");
        assert_eq!(network.attempts(ADMIN), 4);
        assert_eq!(metrics.gateway_attempts("unavailable"), 3);
        assert_eq!(metrics.gateway_attempts("bound"), 1);

        let models = session.admin.available_models().await.expect("models");
        assert!(models.is_empty());
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_max_attempts() {
    local(async {
        let network = network();
        network.refuse_next(ADMIN, 10);
        let gateway = AdminGateway::new(Rc::new(network.clone()), policy(3));

        let err = gateway.connect(ADMIN, None).await.expect_err("exhausted");
        match &err {
            GatewayError::Exhausted { attempts, last, .. } => {
                assert_eq!(*attempts, 3);
                assert!(last.is_transport());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(network.attempts(ADMIN), 3);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn unknown_hosts_are_retried_like_refusals() {
    local(async {
        let gateway = AdminGateway::new(Rc::new(MemoryNetwork::new()), policy(2));
        let err = gateway.connect("nowhere:1", None).await.expect_err("no host");
        assert_eq!(err.attempts(), Some(2));
    })
    .await;
}

#[tokio::test]
async fn a_bootstrap_that_cannot_identify_itself_is_rejected() {
    local(async {
        let network = MemoryNetwork::new();
        let admin: admin_master::Client = capnp_rpc::new_client(Anonymous);
        network.register(ADMIN, admin.client);
        let gateway = AdminGateway::new(Rc::new(network.clone()), policy(3));

        let err = gateway.connect(ADMIN, None).await.expect_err("rejected");
        match err {
            GatewayError::Rejected { source, .. } => assert!(source.is_remote()),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(network.attempts(ADMIN), 1);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn overall_deadline_stops_retrying() {
    local(async {
        let network = network();
        network.refuse_next(ADMIN, u32::MAX);
        let policy = RetryPolicy::new(
            1_000,
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::ZERO,
        )
        .with_timeout(Some(Duration::from_millis(2_500)));
        let gateway = AdminGateway::new(Rc::new(network.clone()), policy);

        let err = gateway.connect(ADMIN, None).await.expect_err("deadline");
        match err {
            GatewayError::TimedOut { attempts, elapsed, .. } => {
                assert_eq!(attempts, 3);
                assert!(elapsed >= Duration::from_millis(2_500));
            }
            other => panic!("unexpected {other:?}"),
        }
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_backoff() {
    local(async {
        let network = network();
        network.refuse_next(ADMIN, u32::MAX);
        let gateway = AdminGateway::new(Rc::new(network.clone()), policy(1_000));
        let (cancel_tx, cancel_rx) = watch::channel(false);

        tokio::task::spawn_local(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            let _ = cancel_tx.send(true);
        });

        let err = gateway
            .connect(ADMIN, Some(cancel_rx))
            .await
            .expect_err("cancelled");
        assert!(matches!(err, GatewayError::Cancelled { attempts, .. } if attempts >= 2));
    })
    .await;
}

#[tokio::test]
async fn cancelled_before_start_makes_no_attempt() {
    local(async {
        let network = network();
        let gateway = AdminGateway::new(Rc::new(network.clone()), policy(3));
        let (_cancel_tx, cancel_rx) = watch::channel(true);

        let err = gateway.connect(ADMIN, Some(cancel_rx)).await.expect_err("cancelled");
        assert_eq!(err.attempts(), Some(0));
        assert_eq!(network.attempts(ADMIN), 0);
    })
    .await;
}

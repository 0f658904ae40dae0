//! ---
//! cs_section: "04-cluster"
//! cs_subsection: "module"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "Prometheus metrics for gateway, provisioning and dispatch."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::Result;
use cropsim_common::SharedRegistry;
use prometheus::{self, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts};

/// Metrics published by the cluster client.
#[derive(Clone)]
pub struct ClusterMetrics {
    registry: SharedRegistry,
    jobs_total: IntCounterVec,
    job_latency_seconds: Histogram,
    gateway_attempts_total: IntCounterVec,
    instances_provisioned_total: IntCounter,
}

impl ClusterMetrics {
    /// Register the cluster metric family against the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let jobs_total = IntCounterVec::new(
            Opts::new(
                "cropsim_jobs_total",
                "Jobs collected by the dispatcher, by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(jobs_total.clone()))?;

        let latency_opts = HistogramOpts::new(
            "cropsim_job_latency_seconds",
            "Time between submitting a job and collecting its result",
        )
        .buckets(prometheus::exponential_buckets(0.001, 2.0, 16)?);
        let job_latency_seconds = Histogram::with_opts(latency_opts)?;
        registry.register(Box::new(job_latency_seconds.clone()))?;

        let gateway_attempts_total = IntCounterVec::new(
            Opts::new(
                "cropsim_gateway_attempts_total",
                "Admin bootstrap attempts, by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(gateway_attempts_total.clone()))?;

        let instances_provisioned_total = IntCounter::with_opts(Opts::new(
            "cropsim_instances_provisioned_total",
            "Model instances obtained or restored",
        ))?;
        registry.register(Box::new(instances_provisioned_total.clone()))?;

        Ok(Self {
            registry,
            jobs_total,
            job_latency_seconds,
            gateway_attempts_total,
            instances_provisioned_total,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    /// Count a collected job. `outcome` is one of `ok`, `empty`, `failed`,
    /// `malformed` or `mismatch`.
    pub fn record_job(&self, outcome: &str, latency: Duration) {
        self.jobs_total.with_label_values(&[outcome]).inc();
        self.job_latency_seconds.observe(latency.as_secs_f64());
    }

    pub fn record_gateway_attempt(&self, outcome: &str) {
        self.gateway_attempts_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn record_provisioned(&self, count: usize) {
        self.instances_provisioned_total.inc_by(count as u64);
    }

    pub fn jobs(&self, outcome: &str) -> u64 {
        self.jobs_total.with_label_values(&[outcome]).get()
    }

    pub fn gateway_attempts(&self, outcome: &str) -> u64 {
        self.gateway_attempts_total
            .with_label_values(&[outcome])
            .get()
    }

    pub fn provisioned(&self) -> u64 {
        self.instances_provisioned_total.get()
    }
}

impl std::fmt::Debug for ClusterMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterMetrics").finish_non_exhaustive()
    }
}

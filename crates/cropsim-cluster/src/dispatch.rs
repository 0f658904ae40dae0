//! ---
//! cs_section: "04-cluster"
//! cs_subsection: "module"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "Round-robin job dispatch and best-effort result aggregation."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
//! Jobs are spread over instances round-robin and submitted without waiting.
//! [`Dispatcher::collect`] waits for all of them; a failed job never hides the
//! results of the others. Results come back in no particular order, so each
//! one is matched to its job through the correlation id embedded in the
//! payload.
use std::cell::Cell;
use std::collections::HashSet;
use std::time::Duration;

use cropsim_common::DispatchConfig;
use cropsim_rpc::{join_settled, Promise, RpcError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ClusterError;
use crate::metrics::ClusterMetrics;
use crate::model::{parse_result, JobRequest, JobResult, ModelInstance};

pub const DEFAULT_CORRELATION_FIELD: &str = "customId";

/// How a batch is fed to the instances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Submit at most this many jobs before waiting for them; `None` submits
    /// everything at once.
    pub window: Option<usize>,
}

impl DispatchOptions {
    pub fn windowed(window: usize) -> Self {
        Self {
            window: Some(window.max(1)),
        }
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            window: config.window.map(|w| w.max(1)),
        }
    }
}

/// A submitted job that has not been collected yet.
#[derive(Debug)]
pub struct PendingJob {
    /// Position in the batch.
    pub index: usize,
    pub correlation_id: String,
    /// Index of the instance it was sent to.
    pub instance: usize,
    started: Instant,
    promise: Promise<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureKind {
    /// The call itself failed.
    Rpc(RpcError),
    /// The result could not be parsed or lacks the correlation field.
    MalformedCorrelation(RpcError),
    /// The result names a different job.
    CorrelationMismatch { found: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobFailure {
    pub index: usize,
    pub correlation_id: String,
    pub kind: FailureKind,
}

impl JobFailure {
    pub fn is_transport(&self) -> bool {
        matches!(&self.kind, FailureKind::Rpc(err) if err.is_transport())
    }

    fn label(&self) -> &'static str {
        match self.kind {
            FailureKind::Rpc(_) => "failed",
            FailureKind::MalformedCorrelation(_) => "malformed",
            FailureKind::CorrelationMismatch { .. } => "mismatch",
        }
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job {} ({}): ", self.index, self.correlation_id)?;
        match &self.kind {
            FailureKind::Rpc(err) => write!(f, "{}", err),
            FailureKind::MalformedCorrelation(err) => write!(f, "malformed result: {}", err),
            FailureKind::CorrelationMismatch { found } => {
                write!(f, "result belongs to job {}", found)
            }
        }
    }
}

/// Everything a batch produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    /// Non-empty results in completion-independent submission order.
    pub results: Vec<JobResult>,
    pub failures: Vec<JobFailure>,
    /// Correlation ids of jobs whose model produced no result.
    pub empty: Vec<String>,
}

impl BatchOutcome {
    /// Sorted correlation ids of the collected results.
    pub fn correlation_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .results
            .iter()
            .map(|r| r.correlation_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// The first failure caused by a broken connection, if any.
    pub fn transport_failure(&self) -> Option<&RpcError> {
        self.failures.iter().find_map(|failure| match &failure.kind {
            FailureKind::Rpc(err) if err.is_transport() => Some(err),
            _ => None,
        })
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn merge(&mut self, other: BatchOutcome) {
        self.results.extend(other.results);
        self.failures.extend(other.failures);
        self.empty.extend(other.empty);
    }
}

/// Sends jobs to a fixed set of instances.
#[derive(Debug)]
pub struct Dispatcher {
    instances: Vec<ModelInstance>,
    next: Cell<usize>,
    correlation_field: String,
    metrics: Option<ClusterMetrics>,
}

impl Dispatcher {
    pub fn new(instances: Vec<ModelInstance>) -> Self {
        Self {
            instances,
            next: Cell::new(0),
            correlation_field: DEFAULT_CORRELATION_FIELD.to_owned(),
            metrics: None,
        }
    }

    pub fn with_correlation_field(mut self, field: impl Into<String>) -> Self {
        self.correlation_field = field.into();
        self
    }

    pub fn with_metrics(mut self, metrics: ClusterMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn instances(&self) -> &[ModelInstance] {
        &self.instances
    }

    /// Submit every job without waiting for any of them. A batch with a
    /// repeated correlation id is rejected before anything is sent.
    pub fn dispatch(&self, jobs: Vec<JobRequest>) -> Result<Vec<PendingJob>, ClusterError> {
        ensure_unique(&jobs)?;
        self.dispatch_from(jobs, 0)
    }

    fn dispatch_from(
        &self,
        jobs: Vec<JobRequest>,
        offset: usize,
    ) -> Result<Vec<PendingJob>, ClusterError> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        if self.instances.is_empty() {
            return Err(ClusterError::NoInstances { jobs: jobs.len() });
        }
        let pending = jobs
            .into_iter()
            .enumerate()
            .map(|(i, job)| {
                let turn = self.next.get();
                self.next.set(turn.wrapping_add(1));
                let instance = turn % self.instances.len();
                debug!(correlation_id = %job.correlation_id, instance, "submitting job");
                PendingJob {
                    index: offset + i,
                    promise: self.instances[instance].run(&job),
                    correlation_id: job.correlation_id,
                    instance,
                    started: Instant::now(),
                }
            })
            .collect();
        Ok(pending)
    }

    /// Wait for every pending job and sort the outcomes.
    pub async fn collect(&self, pending: Vec<PendingJob>) -> BatchOutcome {
        let (meta, promises): (Vec<_>, Vec<_>) = pending
            .into_iter()
            .map(|job| ((job.index, job.correlation_id, job.started), job.promise))
            .unzip();
        let settled = join_settled(promises).await;

        let mut outcome = BatchOutcome::default();
        for ((index, correlation_id, started), result) in meta.into_iter().zip(settled) {
            let latency = started.elapsed();
            match self.classify(result) {
                Ok(Some(result)) if result.correlation_id == correlation_id => {
                    self.record("ok", latency);
                    outcome.results.push(result);
                }
                Ok(Some(result)) => {
                    let failure = JobFailure {
                        index,
                        correlation_id,
                        kind: FailureKind::CorrelationMismatch {
                            found: result.correlation_id,
                        },
                    };
                    warn!(%failure, "job result mismatched");
                    self.record(failure.label(), latency);
                    outcome.failures.push(failure);
                }
                Ok(None) => {
                    debug!(%correlation_id, "job produced no result");
                    self.record("empty", latency);
                    outcome.empty.push(correlation_id);
                }
                Err(kind) => {
                    let failure = JobFailure {
                        index,
                        correlation_id,
                        kind,
                    };
                    warn!(%failure, "job failed");
                    self.record(failure.label(), latency);
                    outcome.failures.push(failure);
                }
            }
        }
        outcome
    }

    fn classify(
        &self,
        result: Result<String, RpcError>,
    ) -> Result<Option<JobResult>, FailureKind> {
        let raw = result.map_err(FailureKind::Rpc)?;
        if raw.is_empty() {
            return Ok(None);
        }
        parse_result(&raw, &self.correlation_field)
            .map(Some)
            .map_err(FailureKind::MalformedCorrelation)
    }

    /// Dispatch and collect `jobs`, window by window. A transport failure
    /// stops the batch; what was collected so far travels in the error.
    pub async fn run_batch(
        &self,
        jobs: Vec<JobRequest>,
        options: DispatchOptions,
    ) -> Result<BatchOutcome, ClusterError> {
        ensure_unique(&jobs)?;
        let total = jobs.len();
        let window = options.window.unwrap_or(total).max(1);
        let mut outcome = BatchOutcome::default();
        let mut remaining = jobs.into_iter();
        let mut offset = 0;

        while offset < total {
            let chunk: Vec<JobRequest> = remaining.by_ref().take(window).collect();
            let submitted = chunk.len();
            let pending = self.dispatch_from(chunk, offset)?;
            let collected = self.collect(pending).await;
            let lost = collected.transport_failure().cloned();
            outcome.merge(collected);
            offset += submitted;

            if let Some(source) = lost {
                warn!(
                    submitted = offset,
                    total,
                    error = %source,
                    "batch stopped by transport failure"
                );
                return Err(ClusterError::SessionLost {
                    outcome: Box::new(outcome),
                    source,
                });
            }
            debug!(submitted = offset, total, "window collected");
        }

        info!(
            jobs = total,
            results = outcome.results.len(),
            empty = outcome.empty.len(),
            failures = outcome.failures.len(),
            "batch complete"
        );
        Ok(outcome)
    }

    fn record(&self, outcome: &str, latency: Duration) {
        if let Some(metrics) = &self.metrics {
            metrics.record_job(outcome, latency);
        }
    }
}

fn ensure_unique(jobs: &[JobRequest]) -> Result<(), ClusterError> {
    let mut seen = HashSet::with_capacity(jobs.len());
    match jobs.iter().find(|job| !seen.insert(job.correlation_id.as_str())) {
        Some(job) => Err(ClusterError::DuplicateCorrelation {
            id: job.correlation_id.clone(),
        }),
        None => Ok(()),
    }
}

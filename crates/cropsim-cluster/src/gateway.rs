//! ---
//! cs_section: "04-cluster"
//! cs_subsection: "module"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "Bounded retry bootstrap of the cluster admin capability."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use cropsim_common::GatewayConfig;
use cropsim_rpc::{Connection, Connector, IdInfo, RpcError, RpcResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::admin::AdminMaster;
use crate::error::GatewayError;
use crate::metrics::ClusterMetrics;

/// Backoff parameters for reaching the admin master.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Attempts before giving up; at least one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubles per attempt.
    pub base_delay: Duration,
    /// Upper bound of the exponential part of the delay.
    pub max_delay: Duration,
    /// Maximum random delay added on top.
    pub jitter: Duration,
    /// Overall deadline across all attempts.
    pub timeout: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, jitter: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.base_delay,
            config.max_delay,
            config.jitter,
        )
        .with_timeout(config.timeout)
    }

    /// Delay after the given failed attempt (1-indexed).
    pub fn backoff_delay(&self, attempt: u32, rng: &mut StdRng) -> Duration {
        let exponent = attempt.saturating_sub(1).min(8);
        let base = self
            .base_delay
            .mul_f64(2u32.pow(exponent) as f64)
            .min(self.max_delay);
        if self.jitter.is_zero() {
            base
        } else {
            let jitter_ms = rng.gen_range(0..=self.jitter.as_millis().max(1)) as u64;
            base + Duration::from_millis(jitter_ms)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&GatewayConfig::default())
    }
}

/// A bound admin capability and the connection that carries it.
#[derive(Debug, Clone)]
pub struct AdminSession {
    pub connection: Connection,
    pub admin: AdminMaster,
    /// Identity the admin master reported when it was bound.
    pub info: IdInfo,
    /// Attempts it took, the successful one included.
    pub attempts: u32,
}

/// Connects to the admin master, retrying transport failures.
pub struct AdminGateway {
    connector: Rc<dyn Connector>,
    policy: RetryPolicy,
    metrics: Option<ClusterMetrics>,
    rng: RefCell<StdRng>,
}

impl AdminGateway {
    pub fn new(connector: Rc<dyn Connector>, policy: RetryPolicy) -> Self {
        Self {
            connector,
            policy,
            metrics: None,
            rng: RefCell::new(StdRng::seed_from_u64(0xC0FF_EE00)),
        }
    }

    /// Seed the jitter RNG for deterministic testing.
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.borrow_mut() = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_metrics(mut self, metrics: ClusterMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Retry until the admin bootstrap is bound, attempts run out, the
    /// deadline passes or `cancel` flips to true. Only transport errors are
    /// retried.
    pub async fn connect(
        &self,
        address: &str,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<AdminSession, GatewayError> {
        let attempts = Cell::new(0);
        let started = Instant::now();
        let deadline = self.policy.timeout;

        let result = tokio::select! {
            biased;
            _ = cancelled(cancel) => Err(GatewayError::Cancelled {
                address: address.to_owned(),
                attempts: attempts.get(),
            }),
            _ = expired(deadline) => Err(GatewayError::TimedOut {
                address: address.to_owned(),
                attempts: attempts.get(),
                elapsed: started.elapsed(),
            }),
            result = self.attempt_loop(address, &attempts) => result,
        };

        if let Err(err) = &result {
            error!(%address, error = %err, "admin gateway gave up");
            self.record(err.outcome());
        }
        result
    }

    async fn attempt_loop(
        &self,
        address: &str,
        attempts: &Cell<u32>,
    ) -> Result<AdminSession, GatewayError> {
        let mut last = None;
        for attempt in 1..=self.policy.max_attempts {
            attempts.set(attempt);
            debug!(%address, attempt, "bootstrapping admin master");
            match self.try_once(address).await {
                Ok((connection, admin, identity)) => {
                    info!(%address, attempt, admin = %identity.name, "admin master bound");
                    self.record("bound");
                    return Ok(AdminSession {
                        connection,
                        admin,
                        info: identity,
                        attempts: attempt,
                    });
                }
                Err(err) if err.is_transport() => {
                    warn!(%address, attempt, error = %err, "admin master unavailable");
                    self.record("unavailable");
                    last = Some(err);
                    if attempt < self.policy.max_attempts {
                        let delay = self
                            .policy
                            .backoff_delay(attempt, &mut self.rng.borrow_mut());
                        sleep(delay).await;
                    }
                }
                Err(err) => {
                    return Err(GatewayError::Rejected {
                        address: address.to_owned(),
                        source: err,
                    })
                }
            }
        }
        Err(GatewayError::Exhausted {
            address: address.to_owned(),
            attempts: self.policy.max_attempts,
            last: last.unwrap_or_else(|| RpcError::Transport {
                peer: address.to_owned(),
                reason: "no attempt was made".to_owned(),
            }),
        })
    }

    /// The bootstrap is only considered bound once the remote answers an
    /// identity call through it.
    async fn try_once(&self, address: &str) -> RpcResult<(Connection, AdminMaster, IdInfo)> {
        let connection = self.connector.connect(address).await?;
        let admin = AdminMaster::bootstrap(&connection);
        match admin.info().await {
            Ok(identity) => Ok((connection, admin, identity)),
            Err(err) => {
                connection.close("admin bootstrap failed");
                Err(err)
            }
        }
    }

    fn record(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_gateway_attempt(outcome);
        }
    }
}

impl std::fmt::Debug for AdminGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminGateway")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

async fn cancelled(cancel: Option<watch::Receiver<bool>>) {
    if let Some(mut cancel) = cancel {
        if cancel.wait_for(|flag| *flag).await.is_ok() {
            return;
        }
    }
    futures::future::pending::<()>().await
}

async fn expired(deadline: Option<Duration>) {
    match deadline {
        Some(deadline) => sleep(deadline).await,
        None => futures::future::pending::<()>().await,
    }
}

//! ---
//! cs_section: "04-cluster"
//! cs_subsection: "module"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "Model instance handle and job request/result types."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
use std::fs;
use std::path::Path;

use cropsim_rpc::{CapKind, Promise, PromisedCap, RpcError};
use cropsim_schema::climate_data::time_series;
use cropsim_schema::model::env_instance;
use serde_json::Value as JsonValue;

use crate::error::ClusterError;

/// A live simulation-model instance.
#[derive(Debug, Clone)]
pub struct ModelInstance {
    cap: PromisedCap<env_instance::Client>,
}

impl ModelInstance {
    pub const KIND: CapKind = CapKind::ModelInstance;

    pub fn new(cap: PromisedCap<env_instance::Client>) -> Self {
        Self { cap }
    }

    pub fn capability(&self) -> &PromisedCap<env_instance::Client> {
        &self.cap
    }

    pub fn model_id(&self) -> Promise<String> {
        let response = self.cap.client().model_id_request().send().promise;
        Promise::new(async move { Ok(response.await?.get()?.get_id()?.to_str()?.to_owned()) })
    }

    /// Submit one job. Resolves to the raw result text; empty text means the
    /// model produced no result. The call is sent at once, pipelined onto the
    /// instance even if it has not resolved yet.
    pub fn run(&self, request: &JobRequest) -> Promise<String> {
        let mut call = self.cap.client().run_request();
        {
            let mut params = call.get();
            let mut rest = params.reborrow().init_rest();
            rest.set_value(&request.env.to_string());
            rest.init_structure().set_json(());
            if let Some(time_series) = &request.time_series {
                params.set_time_series(time_series.clone());
            }
        }
        let response = call.send().promise;
        Promise::new(async move {
            let response = response.await?;
            let value = response.get()?.get_result()?.get_value()?.to_str()?.to_owned();
            Ok(value)
        })
    }
}

/// One simulation job.
#[derive(Clone)]
pub struct JobRequest {
    pub correlation_id: String,
    /// Full environment, correlation field included.
    pub env: JsonValue,
    pub time_series: Option<time_series::Client>,
}

/// A collected, non-empty job result.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    /// Read back from the result payload, not from the request.
    pub correlation_id: String,
    pub value: JsonValue,
}

impl std::fmt::Debug for JobRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRequest")
            .field("correlation_id", &self.correlation_id)
            .field("env", &self.env)
            .field("time_series", &self.time_series.is_some())
            .finish()
    }
}

/// Immutable base environment from which per-job environments are derived.
#[derive(Clone)]
pub struct JobTemplate {
    base: JsonValue,
    correlation_field: String,
    time_series: Option<time_series::Client>,
}

impl std::fmt::Debug for JobTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobTemplate")
            .field("correlation_field", &self.correlation_field)
            .field("time_series", &self.time_series.is_some())
            .finish_non_exhaustive()
    }
}

impl JobTemplate {
    pub fn new(base: JsonValue, correlation_field: impl Into<String>) -> Result<Self, ClusterError> {
        if !base.is_object() {
            return Err(ClusterError::InvalidTemplate(
                "base environment must be a JSON object".to_owned(),
            ));
        }
        let correlation_field = correlation_field.into();
        if correlation_field.is_empty() {
            return Err(ClusterError::InvalidTemplate(
                "correlation field cannot be empty".to_owned(),
            ));
        }
        Ok(Self {
            base,
            correlation_field,
            time_series: None,
        })
    }

    pub fn from_file(path: &Path, correlation_field: &str) -> Result<Self, ClusterError> {
        let contents = fs::read_to_string(path).map_err(|source| ClusterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::new(serde_json::from_str(&contents)?, correlation_field)
    }

    /// Attach the climate time series every job of this template uses.
    pub fn with_time_series(mut self, time_series: time_series::Client) -> Self {
        self.time_series = Some(time_series);
        self
    }

    pub fn correlation_field(&self) -> &str {
        &self.correlation_field
    }

    /// A request whose environment differs from the base only in the
    /// correlation field.
    pub fn job(&self, correlation_id: impl Into<String>) -> JobRequest {
        let correlation_id = correlation_id.into();
        let mut env = self.base.clone();
        if let Some(fields) = env.as_object_mut() {
            fields.insert(
                self.correlation_field.clone(),
                JsonValue::String(correlation_id.clone()),
            );
        }
        JobRequest {
            correlation_id,
            env,
            time_series: self.time_series.clone(),
        }
    }

    /// Jobs `"0"`, `"1"`, ... `count - 1`.
    pub fn numbered(&self, count: usize) -> Vec<JobRequest> {
        (0..count).map(|i| self.job(i.to_string())).collect()
    }
}

/// Read the correlation id back out of a raw result.
pub fn correlation_of(raw: &str, field: &str) -> Result<String, RpcError> {
    parse_result(raw, field).map(|result| result.correlation_id)
}

/// Parse a raw, non-empty result and promote its correlation id.
pub fn parse_result(raw: &str, field: &str) -> Result<JobResult, RpcError> {
    let value: JsonValue = serde_json::from_str(raw)
        .map_err(|err| RpcError::payload(format!("result is not JSON: {}", err)))?;
    let correlation_id = match value.get(field) {
        Some(JsonValue::String(id)) => id.clone(),
        Some(JsonValue::Number(id)) => id.to_string(),
        Some(other) => {
            return Err(RpcError::payload(format!(
                "'{}' is not a string but {}",
                field, other
            )))
        }
        None => return Err(RpcError::payload(format!("result has no '{}'", field))),
    };
    Ok(JobResult {
        correlation_id,
        value,
    })
}

//! ---
//! cs_section: "01-core-functionality"
//! cs_subsection: "module"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "Shared primitives and utilities for the orchestrator."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::{debug, warn};

use crate::logging::LogFormat;

fn default_climate_address() -> String {
    "localhost:11001".to_owned()
}

fn default_admin_address() -> String {
    "localhost:8000".to_owned()
}

fn default_max_attempts() -> u32 {
    20
}

fn default_base_delay() -> Duration {
    Duration::from_millis(250)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_jitter() -> Duration {
    Duration::from_millis(50)
}

fn default_gateway_timeout() -> Option<Duration> {
    Some(Duration::from_secs(60))
}

fn default_instances() -> usize {
    1
}

fn default_jobs() -> usize {
    5
}

fn default_window() -> Option<usize> {
    Some(50)
}

fn default_correlation_field() -> String {
    "customId".to_owned()
}

fn default_latitude() -> f64 {
    46.51412
}

fn default_longitude() -> f64 {
    12.81895
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

/// Primary configuration object for the orchestrator binaries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub endpoints: EndpointConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub climate: ClimateQueryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    /// `None` when no candidate existed and defaults were used.
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "CROPSIM_CONFIG";

    /// Load configuration from disk, respecting the `CROPSIM_CONFIG` override.
    ///
    /// Missing candidates are not an error: the orchestrator is usable with
    /// defaults plus `key=value` overrides, just like the scripts it replaces.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            let candidate = candidate.as_ref();
            if candidate.exists() {
                let config = Self::from_path(candidate)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(candidate.to_path_buf()),
                });
            }
        }

        debug!("no configuration file found, using defaults");
        Ok(LoadedAppConfig {
            config: AppConfig::default(),
            source: None,
        })
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Apply `key=value` overrides in order. Returns the keys that were not
    /// recognised; those are skipped rather than rejected.
    pub fn apply_overrides<I, S>(&mut self, args: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ignored = Vec::new();
        for arg in args {
            let arg = arg.as_ref();
            let (key, value) = arg
                .split_once('=')
                .ok_or_else(|| anyhow!("override '{}' is not of the form key=value", arg))?;
            let (key, value) = (key.trim(), value.trim());
            if !self.apply_override(key, value)? {
                warn!(key, "ignoring unknown configuration override");
                ignored.push(key.to_owned());
            }
        }
        self.validate()?;
        Ok(ignored)
    }

    fn apply_override(&mut self, key: &str, value: &str) -> Result<bool> {
        match key {
            "climate_data_service_address" => self.endpoints.climate_data_service = value.to_owned(),
            "admin_master_address" => self.endpoints.admin_master = value.to_owned(),
            "gateway.max_attempts" => self.gateway.max_attempts = parse_value(key, value)?,
            "gateway.base_delay_ms" => {
                self.gateway.base_delay = Duration::from_millis(parse_value(key, value)?)
            }
            "gateway.max_delay_ms" => {
                self.gateway.max_delay = Duration::from_millis(parse_value(key, value)?)
            }
            "gateway.timeout_ms" => {
                let millis: u64 = parse_value(key, value)?;
                self.gateway.timeout = (millis > 0).then(|| Duration::from_millis(millis));
            }
            "instances" => self.dispatch.instances = parse_value(key, value)?,
            "jobs" => self.dispatch.jobs = parse_value(key, value)?,
            "window" => {
                let window: usize = parse_value(key, value)?;
                self.dispatch.window = (window > 0).then_some(window);
            }
            "env_template" => self.dispatch.env_template = Some(PathBuf::from(value)),
            "correlation_field" => self.dispatch.correlation_field = value.to_owned(),
            "lat" => self.climate.latitude = parse_value(key, value)?,
            "lon" => self.climate.longitude = parse_value(key, value)?,
            "log_format" => {
                self.logging.format = match value {
                    "json" | "structured-json" => LogFormat::StructuredJson,
                    "pretty" => LogFormat::Pretty,
                    other => bail!("unknown log format '{}'", other),
                }
            }
            "log_dir" => self.logging.directory = Some(PathBuf::from(value)),
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.endpoints.validate()?;
        self.gateway.validate()?;
        self.dispatch.validate()?;
        self.climate.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|err| anyhow!("invalid value '{}' for '{}': {}", value, key, err))
}

/// Remote service addresses, `host:port` strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "default_climate_address")]
    pub climate_data_service: String,
    #[serde(default = "default_admin_address")]
    pub admin_master: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            climate_data_service: default_climate_address(),
            admin_master: default_admin_address(),
        }
    }
}

impl EndpointConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, address) in [
            ("climate_data_service", &self.climate_data_service),
            ("admin_master", &self.admin_master),
        ] {
            match address.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
                _ => bail!("endpoint {} must be host:port, got '{}'", name, address),
            }
        }
        Ok(())
    }
}

/// Retry policy for the admin gateway bootstrap.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub base_delay: Duration,
    #[serde(default = "default_max_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_delay: Duration,
    #[serde(default = "default_jitter")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub jitter: Duration,
    #[serde(default = "default_gateway_timeout")]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub timeout: Option<Duration>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
            timeout: default_gateway_timeout(),
        }
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            bail!("gateway.max_attempts must be at least 1");
        }
        if self.max_delay < self.base_delay {
            bail!("gateway.max_delay must not be smaller than gateway.base_delay");
        }
        Ok(())
    }
}

/// Batch shape for the job dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_instances")]
    pub instances: usize,
    #[serde(default = "default_jobs")]
    pub jobs: usize,
    #[serde(default = "default_window")]
    pub window: Option<usize>,
    /// JSON file holding the base simulation environment.
    #[serde(default)]
    pub env_template: Option<PathBuf>,
    #[serde(default = "default_correlation_field")]
    pub correlation_field: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            instances: default_instances(),
            jobs: default_jobs(),
            window: default_window(),
            env_template: None,
            correlation_field: default_correlation_field(),
        }
    }
}

impl DispatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.jobs > 0 && self.instances == 0 {
            bail!("dispatching {} jobs requires at least one instance", self.jobs);
        }
        if self.window == Some(0) {
            bail!("dispatch.window must be positive when set");
        }
        if self.correlation_field.trim().is_empty() {
            bail!("dispatch.correlation_field cannot be empty");
        }
        Ok(())
    }
}

/// Coordinate used when resolving the nearest climate time series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClimateQueryConfig {
    #[serde(default = "default_latitude")]
    pub latitude: f64,
    #[serde(default = "default_longitude")]
    pub longitude: f64,
}

impl Default for ClimateQueryConfig {
    fn default() -> Self {
        Self {
            latitude: default_latitude(),
            longitude: default_longitude(),
        }
    }
}

impl ClimateQueryConfig {
    pub fn validate(&self) -> Result<()> {
        if !(-90.0..=90.0).contains(&self.latitude) {
            bail!("latitude {} outside [-90, 90]", self.latitude);
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            bail!("longitude {} outside [-180, 180]", self.longitude);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for the rolling JSON log file. Stdout only when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

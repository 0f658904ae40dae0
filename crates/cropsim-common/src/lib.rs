//! ---
//! cs_section: "01-core-functionality"
//! cs_subsection: "module"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "Shared primitives and utilities for the orchestrator."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
//! Shared primitives for the cropsim orchestrator workspace.
//! This crate exposes configuration loading, tracing initialisation and the
//! metrics registry consumed by the library crates and binaries.

pub mod config;
pub mod logging;
pub mod metrics;

pub use config::{
    AppConfig, ClimateQueryConfig, DispatchConfig, EndpointConfig, GatewayConfig,
    LoadedAppConfig, LoggingConfig,
};
pub use logging::{init_tracing, LogFormat};
pub use metrics::{new_registry, render_registry, SharedRegistry};

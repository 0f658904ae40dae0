//! ---
//! cs_section: "01-core-functionality"
//! cs_subsection: "module"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "Metrics registry helpers."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::Result;
use prometheus::{Registry, TextEncoder};

/// Shared registry type used across crates.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Encode every family in the registry using the Prometheus text format.
pub fn render_registry(registry: &SharedRegistry) -> Result<String> {
    let families = registry.gather();
    Ok(TextEncoder::new().encode_to_string(&families)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{IntCounter, Opts};

    #[test]
    fn rendered_registry_contains_registered_counter() {
        let registry = new_registry();
        let counter = IntCounter::with_opts(Opts::new("cropsim_test_total", "test counter"))
            .expect("counter");
        registry
            .register(Box::new(counter.clone()))
            .expect("register");
        counter.inc_by(3);

        let text = render_registry(&registry).expect("render");
        assert!(text.contains("cropsim_test_total 3"));
    }
}

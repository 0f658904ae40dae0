//! ---
//! cs_section: "02-rpc-pipeline"
//! cs_subsection: "build"
//! cs_type: "source"
//! cs_scope: "build"
//! cs_description: "Compiles the Cap'n Proto schemas into Rust modules."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
//! Requires the `capnp` compiler on `PATH`.

const SCHEMAS: [&str; 6] = [
    "schema/common.capnp",
    "schema/date.capnp",
    "schema/geo_coord.capnp",
    "schema/climate_data.capnp",
    "schema/model.capnp",
    "schema/cluster_admin_service.capnp",
];

#[allow(clippy::expect_used)]
fn main() {
    let mut command = capnpc::CompilerCommand::new();
    command.src_prefix("schema");
    for schema in SCHEMAS {
        println!("cargo::rerun-if-changed={schema}");
        command.file(schema);
    }
    command.run().expect("capnp schema compilation failed");
}

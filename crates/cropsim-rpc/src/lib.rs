//! ---
//! cs_section: "02-rpc-pipeline"
//! cs_subsection: "module"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "Capability RPC engine used by the cropsim orchestrator."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
//! Capability plumbing on top of Cap'n Proto RPC.
//!
//! [`Connection`] runs a two-party `RpcSystem` over any byte stream (TCP or
//! an in-memory [`MemoryNetwork`] pipe). Calls return a [`Promise`] for a
//! request already on the wire; a [`PromisedCap`] carries the pipelined
//! client of a capability that has not resolved yet, so dependent calls are
//! sent without waiting for the first answer.
//!
//! Everything here is single-threaded (`Rc`, `spawn_local`) and expects to
//! run inside a `tokio::task::LocalSet`.

pub mod capability;
pub mod connect;
pub mod error;
pub mod memory;
pub mod promise;

pub use capability::{identify, save, CapKind, CapRef, IdInfo, Liveness, SturdyRef};
pub use connect::{connect, serve, Connection, Connector, TcpConnector};
pub use error::{RemoteErrorKind, RpcError, RpcResult};
pub use memory::MemoryNetwork;
pub use promise::{join_all, join_pair, join_settled, Promise, PromisedCap};

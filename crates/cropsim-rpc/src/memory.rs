//! ---
//! cs_section: "02-rpc-pipeline"
//! cs_subsection: "module"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "In-process network of duplex pipes with fault injection."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use async_trait::async_trait;
use capnp_rpc::rpc_twoparty_capnp::Side;
use tracing::debug;

use crate::connect::{Connection, Connector};
use crate::error::{RpcError, RpcResult};

const PIPE_CAPACITY: usize = 64 * 1024;

struct Host {
    bootstrap: capnp::capability::Client,
    refusals: u32,
    connections: Vec<Connection>,
}

#[derive(Default)]
struct NetworkState {
    hosts: HashMap<String, Host>,
    attempts: HashMap<String, u32>,
}

/// Address registry whose connections are in-memory duplex pipes carrying
/// the same capnp two-party protocol as TCP.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Rc<RefCell<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `bootstrap` at `address`, replacing any previous registration.
    pub fn register(&self, address: &str, bootstrap: capnp::capability::Client) {
        self.state.borrow_mut().hosts.insert(
            address.to_owned(),
            Host {
                bootstrap,
                refusals: 0,
                connections: Vec::new(),
            },
        );
    }

    /// Take `address` offline and drop its connections.
    pub fn unregister(&self, address: &str) {
        let host = self.state.borrow_mut().hosts.remove(address);
        if let Some(host) = host {
            for connection in host.connections {
                connection.close("host went offline");
            }
        }
    }

    /// Refuse the next `count` connection attempts to `address`.
    pub fn refuse_next(&self, address: &str, count: u32) {
        if let Some(host) = self.state.borrow_mut().hosts.get_mut(address) {
            host.refusals = count;
        }
    }

    /// Drop every open connection to `address` from the server side.
    pub fn sever(&self, address: &str) {
        let connections = match self.state.borrow_mut().hosts.get_mut(address) {
            Some(host) => std::mem::take(&mut host.connections),
            None => Vec::new(),
        };
        debug!(%address, connections = connections.len(), "severing connections");
        for connection in connections {
            connection.close("connection severed");
        }
    }

    /// Connection attempts made to `address`, refused ones included.
    pub fn attempts(&self, address: &str) -> u32 {
        self.state.borrow().attempts.get(address).copied().unwrap_or(0)
    }

    /// Connections accepted by `address` that are still open.
    pub fn open_connections(&self, address: &str) -> usize {
        self.state.borrow().hosts.get(address).map_or(0, |host| {
            host.connections.iter().filter(|c| !c.is_closed()).count()
        })
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        let mut hosts: Vec<&str> = state.hosts.keys().map(String::as_str).collect();
        hosts.sort_unstable();
        f.debug_struct("MemoryNetwork").field("hosts", &hosts).finish()
    }
}

#[async_trait(?Send)]
impl Connector for MemoryNetwork {
    async fn connect(&self, address: &str) -> RpcResult<Connection> {
        let refused = |reason: &str| RpcError::Transport {
            peer: address.to_owned(),
            reason: reason.to_owned(),
        };
        let mut state = self.state.borrow_mut();
        *state.attempts.entry(address.to_owned()).or_default() += 1;
        let host = state
            .hosts
            .get_mut(address)
            .ok_or_else(|| refused("no such host"))?;
        if host.refusals > 0 {
            host.refusals -= 1;
            return Err(refused("connection refused"));
        }
        let (client_io, server_io) = tokio::io::duplex(PIPE_CAPACITY);
        let server = Connection::establish(
            server_io,
            format!("memory-client@{}", address),
            Side::Server,
            Some(host.bootstrap.clone()),
        );
        host.connections.retain(|connection| !connection.is_closed());
        host.connections.push(server);
        Ok(Connection::establish(client_io, address, Side::Client, None))
    }
}

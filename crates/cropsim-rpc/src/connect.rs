//! ---
//! cs_section: "02-rpc-pipeline"
//! cs_subsection: "module"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "Two-party capnp connections, connectors and the TCP accept loop."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
//! Every connection runs its `RpcSystem` with `spawn_local`, so connections
//! must be created inside a `tokio::task::LocalSet`.
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use capnp::capability::FromClientHook;
use capnp_rpc::rpc_twoparty_capnp::Side;
use capnp_rpc::{twoparty, Disconnector, RpcSystem};
use futures::AsyncReadExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::compat::TokioAsyncReadCompatExt;
use tracing::{debug, info, warn};

use crate::error::{RpcError, RpcResult};

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// One end of a two-party connection.
#[derive(Clone)]
pub struct Connection {
    inner: Rc<Inner>,
}

struct Inner {
    id: u64,
    peer: String,
    remote: capnp::capability::Client,
    disconnector: RefCell<Option<Disconnector<Side>>>,
    requested: Rc<RefCell<Option<String>>>,
    closed: watch::Receiver<Option<String>>,
}

impl Connection {
    /// Run the RPC system over an established stream. `bootstrap` is what the
    /// peer receives when it asks for this side's bootstrap capability.
    pub fn establish<S>(
        stream: S,
        peer: impl Into<String>,
        side: Side,
        bootstrap: Option<capnp::capability::Client>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + 'static,
    {
        let peer = peer.into();
        let id = NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed);
        let (reader, writer) = stream.compat().split();
        let network = twoparty::VatNetwork::new(reader, writer, side, Default::default());
        let mut rpc_system = RpcSystem::new(Box::new(network), bootstrap);
        let remote: capnp::capability::Client = rpc_system.bootstrap(opposite(side));
        let disconnector = rpc_system.get_disconnector();

        let (closed_tx, closed) = watch::channel(None);
        let requested = Rc::new(RefCell::new(None));
        let reason_slot = requested.clone();
        let label = peer.clone();
        tokio::task::spawn_local(async move {
            let outcome = rpc_system.await;
            let reason = match (reason_slot.borrow_mut().take(), outcome) {
                (Some(reason), _) => reason,
                (None, Ok(())) => "peer closed the connection".to_owned(),
                (None, Err(err)) => err.to_string(),
            };
            debug!(connection = id, peer = %label, %reason, "rpc system stopped");
            let _ = closed_tx.send(Some(reason));
        });
        debug!(connection = id, %peer, ?side, "connection established");

        Self {
            inner: Rc::new(Inner {
                id,
                peer,
                remote,
                disconnector: RefCell::new(Some(disconnector)),
                requested,
                closed,
            }),
        }
    }

    /// The peer's bootstrap capability, typed as `T`. Calls on it are
    /// pipelined until the bootstrap answer arrives.
    pub fn bootstrap<T: FromClientHook>(&self) -> T {
        T::new(self.inner.remote.hook.add_ref())
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.borrow().is_some()
    }

    pub fn close_reason(&self) -> Option<String> {
        self.inner.closed.borrow().clone()
    }

    /// Close the connection. Outstanding calls fail with `Disconnected` and
    /// every capability imported over it becomes unusable.
    pub fn close(&self, reason: &str) {
        let Some(disconnector) = self.inner.disconnector.borrow_mut().take() else {
            return;
        };
        info!(connection = self.inner.id, peer = %self.inner.peer, %reason, "closing connection");
        self.inner.requested.borrow_mut().get_or_insert_with(|| reason.to_owned());
        tokio::task::spawn_local(async move {
            if let Err(err) = disconnector.await {
                debug!(error = %err, "disconnect finished with an error");
            }
        });
    }

    /// Resolve once the connection has closed, for whatever reason.
    pub async fn closed(&self) {
        let mut closed = self.inner.closed.clone();
        let _ = closed.wait_for(Option::is_some).await;
    }
}

fn opposite(side: Side) -> Side {
    match side {
        Side::Client => Side::Server,
        Side::Server => Side::Client,
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("peer", &self.peer())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Opens client connections to an address.
#[async_trait(?Send)]
pub trait Connector {
    async fn connect(&self, address: &str) -> RpcResult<Connection>;
}

/// Connector for `host:port` addresses over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub connect_timeout: Duration,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait(?Send)]
impl Connector for TcpConnector {
    async fn connect(&self, address: &str) -> RpcResult<Connection> {
        let transport = |reason: String| RpcError::Transport {
            peer: address.to_owned(),
            reason,
        };
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| transport(format!("connect timed out after {:?}", self.connect_timeout)))?
            .map_err(|err| transport(err.to_string()))?;
        let _ = stream.set_nodelay(true);
        debug!(%address, "tcp connection established");
        Ok(Connection::establish(stream, address, Side::Client, None))
    }
}

/// Connect to `address` over TCP with default settings.
pub async fn connect(address: &str) -> RpcResult<Connection> {
    TcpConnector::default().connect(address).await
}

/// Accept connections on `listener`, offering `bootstrap` to every client,
/// until `shutdown` flips to true. Open connections are closed on shutdown.
pub async fn serve(
    listener: TcpListener,
    bootstrap: capnp::capability::Client,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let local = listener.local_addr()?;
    info!(address = %local, "serving capability");
    let mut connections: Vec<Connection> = Vec::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let _ = stream.set_nodelay(true);
                    debug!(peer = %addr, "accepted connection");
                    connections.retain(|connection| !connection.is_closed());
                    connections.push(Connection::establish(
                        stream,
                        addr.to_string(),
                        Side::Server,
                        Some(bootstrap.clone()),
                    ));
                }
                Err(err) => warn!(error = %err, "accept failed"),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    for connection in connections {
        connection.close("server shutting down");
    }
    info!(address = %local, "server stopped");
    Ok(())
}

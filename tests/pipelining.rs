//! ---
//! cs_section: "07-testing"
//! cs_subsection: "integration-tests"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "Wire-level check that dependent calls go out before their target resolves."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
//! Records every byte the client writes and decodes it as capnp rpc frames.
use std::cell::RefCell;
use std::io;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

use capnp::message::ReaderOptions;
use capnp::serialize;
use capnp_rpc::rpc_capnp::{message, message_target};
use capnp_rpc::rpc_twoparty_capnp::Side;
use cropsim_cluster::{AdminMaster, JobTemplate};
use cropsim_rpc::Connection;
use cropsim_testharness::{run_local, ClusterBehaviour, StubCluster};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::watch;

struct Tap {
    inner: DuplexStream,
    sent: Rc<RefCell<Vec<u8>>>,
}

impl AsyncRead for Tap {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Tap {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let written = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &written {
            this.sent.borrow_mut().extend_from_slice(&buf[..*n]);
        }
        written
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Calls whose target is the answer to an earlier, possibly unanswered, call.
fn pipelined_calls(bytes: &[u8]) -> usize {
    let mut rest = bytes;
    let mut count = 0;
    while !rest.is_empty() {
        let Ok(frame) = serialize::read_message_from_flat_slice(&mut rest, ReaderOptions::new())
        else {
            break;
        };
        let Ok(root) = frame.get_root::<message::Reader>() else {
            continue;
        };
        if let Ok(message::Which::Call(Ok(call))) = root.which() {
            let target = call
                .get_target()
                .and_then(|target| target.which().map_err(capnp::Error::from));
            if let Ok(message_target::Which::PromisedAnswer(_)) = target {
                count += 1;
            }
        }
    }
    count
}

async fn settle_until(mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    done()
}

#[tokio::test]
async fn holder_and_run_calls_leave_before_the_factory_answers() {
    run_local(async {
        let (open, gate) = watch::channel(false);
        let cluster = StubCluster::new(ClusterBehaviour::default().gated(gate));
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let _server = Connection::establish(
            server_io,
            "client",
            Side::Server,
            Some(cluster.admin().client),
        );
        let sent = Rc::new(RefCell::new(Vec::new()));
        let conn = Connection::establish(
            Tap {
                inner: client_io,
                sent: sent.clone(),
            },
            "cluster",
            Side::Client,
            None,
        );

        let factory = AdminMaster::bootstrap(&conn)
            .available_models()
            .await
            .expect("factories")
            .remove(0);
        let before = pipelined_calls(&sent.borrow());

        let job = JobTemplate::new(json!({"crop": "maize"}), "customId")
            .expect("template")
            .job("0");
        let instance = factory.new_instance().cap();
        let result = instance.run(&job);

        let on_the_wire = settle_until(|| pipelined_calls(&sent.borrow()) >= before + 2).await;
        assert!(on_the_wire, "cap and run were not sent ahead of the answer");
        assert_eq!(cluster.live_instances(), 0, "factory has not answered yet");

        open.send(true).expect("open gate");
        let raw = result.await.expect("run");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(value["customId"], "0");
        assert_eq!(value["crop"], "maize");
        assert_eq!(cluster.live_instances(), 1);
        assert_eq!(cluster.runs(), 1);
    })
    .await;
}

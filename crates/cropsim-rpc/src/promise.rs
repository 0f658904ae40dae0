//! ---
//! cs_section: "02-rpc-pipeline"
//! cs_subsection: "module"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "Pending results, pipelined capabilities and joins."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
//! Requests are written to the connection when they are sent, so a
//! [`Promise`] built around a capnp response refers to a call already in
//! flight. Awaiting (or [`Promise::wait`]) is the only suspension point.
//! Dropping a promise releases interest in the result; the remote work
//! continues.
//!
//! A [`PromisedCap`] pairs the pipelined client of a capability-typed result
//! with the completion of the call that produces it. Calls on the client go
//! out immediately, addressed to the pending answer.
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::{LocalBoxFuture, Shared};
use futures::FutureExt;

use crate::error::{RpcError, RpcResult};

/// Handle to a result that resolves once.
#[must_use = "a promise does nothing unless waited on; dropping it discards the result"]
pub struct Promise<T> {
    inner: LocalBoxFuture<'static, RpcResult<T>>,
}

impl<T: 'static> Promise<T> {
    pub fn new<F>(fut: F) -> Self
    where
        F: Future<Output = RpcResult<T>> + 'static,
    {
        Self {
            inner: fut.boxed_local(),
        }
    }

    pub fn ready(value: T) -> Self {
        Self::new(futures::future::ready(Ok(value)))
    }

    pub fn failed(err: RpcError) -> Self {
        Self::new(futures::future::ready(Err(err)))
    }

    pub async fn wait(self) -> RpcResult<T> {
        self.await
    }

    /// Transform the resolved value.
    pub fn map<U, F>(self, f: F) -> Promise<U>
    where
        U: 'static,
        F: FnOnce(T) -> RpcResult<U> + 'static,
    {
        Promise::new(async move { f(self.await?) })
    }

    /// Chain an asynchronous continuation.
    pub fn then<U, F, Fut>(self, f: F) -> Promise<U>
    where
        U: 'static,
        F: FnOnce(T) -> Fut + 'static,
        Fut: Future<Output = RpcResult<U>> + 'static,
    {
        Promise::new(async move { f(self.await?).await })
    }
}

impl Promise<()> {
    /// Completion of a call whose payload is read elsewhere, typically the
    /// response half of a request whose pipeline is already in use.
    pub fn completion<R, E, F>(fut: F) -> Self
    where
        F: Future<Output = Result<R, E>> + 'static,
        RpcError: From<E>,
    {
        Self::new(async move {
            fut.await?;
            Ok(())
        })
    }
}

impl<T> Future for Promise<T> {
    type Output = RpcResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise").finish_non_exhaustive()
    }
}

/// A capability that may still be pending.
///
/// `client` is usable right away: calls made on it are pipelined onto the
/// answer that will carry the capability. `wait` reports whether that answer
/// actually arrived.
#[derive(Clone)]
pub struct PromisedCap<C> {
    client: C,
    resolution: Shared<LocalBoxFuture<'static, RpcResult<()>>>,
}

impl<C: Clone> PromisedCap<C> {
    pub fn new(client: C, resolution: Promise<()>) -> Self {
        Self {
            client,
            resolution: resolution.boxed_local().shared(),
        }
    }

    pub fn resolved(client: C) -> Self {
        Self::new(client, Promise::ready(()))
    }

    /// The pipelined client; calls on it do not wait for resolution.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// True once the producing call has finished, successfully or not.
    pub fn is_settled(&self) -> bool {
        self.resolution.peek().is_some()
    }

    /// Wait for the producing call and hand out the client.
    pub async fn wait(&self) -> RpcResult<C> {
        self.resolution.clone().await?;
        Ok(self.client.clone())
    }
}

impl<C> std::fmt::Debug for PromisedCap<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromisedCap")
            .field("settled", &self.resolution.peek().is_some())
            .finish_non_exhaustive()
    }
}

/// Fail-fast join: the first failure wins, results keep input order.
pub async fn join_all<T: 'static>(promises: impl IntoIterator<Item = Promise<T>>) -> RpcResult<Vec<T>> {
    futures::future::try_join_all(promises).await
}

/// Best-effort join: every promise settles, outcomes keep input order.
pub async fn join_settled<T: 'static>(
    promises: impl IntoIterator<Item = Promise<T>>,
) -> Vec<RpcResult<T>> {
    futures::future::join_all(promises).await
}

/// Fail-fast join of two promises of different types.
pub async fn join_pair<A: 'static, B: 'static>(a: Promise<A>, b: Promise<B>) -> RpcResult<(A, B)> {
    futures::future::try_join(a, b).await
}

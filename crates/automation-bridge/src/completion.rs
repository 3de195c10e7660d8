//! Single-assignment completion handles.
//!
//! A request's outcome is written exactly once through a [`Settler`] (consumed
//! on use) and read any number of times through cloned [`Completion`]s, which
//! is what lets coalesced callers share one in-flight dispatch.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::oneshot;

use crate::error::BridgeError;
use crate::protocol::AutomationResponse;
use crate::request_id::RequestId;

pub type CompletionResult = Result<AutomationResponse, BridgeError>;

/// Write side of a completion. Settling consumes it.
#[derive(Debug)]
pub struct Settler {
    tx: oneshot::Sender<CompletionResult>,
}

impl Settler {
    pub fn settle(self, result: CompletionResult) {
        // Receiver gone means every waiter lost interest; nothing to do.
        let _ = self.tx.send(result);
    }

    #[cfg(test)]
    pub fn succeed(self, response: AutomationResponse) {
        self.settle(Ok(response));
    }

    #[cfg(test)]
    pub fn fail(self, error: BridgeError) {
        self.settle(Err(error));
    }
}

/// Awaitable, cloneable read side of a request's outcome.
///
/// Resolves to [`BridgeError::Abandoned`] if the settler is dropped unused.
#[derive(Clone)]
pub struct Completion {
    request_id: RequestId,
    inner: Shared<BoxFuture<'static, CompletionResult>>,
}

impl Completion {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Outcome if already settled and observed by some poll.
    pub fn peek(&self) -> Option<&CompletionResult> {
        self.inner.peek()
    }

    /// True if both handles read the same underlying request.
    pub fn same_request(&self, other: &Completion) -> bool {
        self.request_id == other.request_id
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("request_id", &self.request_id)
            .field("settled", &self.peek().is_some())
            .finish()
    }
}

impl Future for Completion {
    type Output = CompletionResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

/// Create a linked settler/completion pair for `request_id`.
pub fn channel(request_id: RequestId) -> (Settler, Completion) {
    let (tx, rx) = oneshot::channel();
    let inner = rx
        .map(|received| received.unwrap_or(Err(BridgeError::Abandoned)))
        .boxed()
        .shared();
    (Settler { tx }, Completion { request_id, inner })
}

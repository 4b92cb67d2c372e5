//! One-shot completion results for asynchronous operations
//!
//! A [`CompletionResolver`] and its [`CompletionFuture`] form a
//! single-assignment slot: the worker performing an operation resolves it
//! exactly once, the owner either awaits the future or blocks on it from a
//! plain thread.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

static NEXT_COMPLETION_ID: AtomicU64 = AtomicU64::new(1);

/// Create a connected resolver / future pair
pub fn completion<T>() -> (CompletionResolver<T>, CompletionFuture<T>) {
    let id = NEXT_COMPLETION_ID.fetch_add(1, Ordering::SeqCst);
    let (tx, rx) = oneshot::channel();
    (
        CompletionResolver { id, tx },
        CompletionFuture { id, rx },
    )
}

/// The write side of a completion; consumed on use
#[derive(Debug)]
pub struct CompletionResolver<T> {
    id: u64,
    tx: oneshot::Sender<T>,
}

impl<T> CompletionResolver<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Resolve the completion. Returns `false` if the future was dropped.
    pub fn resolve(self, value: T) -> bool {
        self.tx.send(value).is_ok()
    }
}

/// The read side of a completion
///
/// Resolves to `None` if the resolver was dropped without resolving, which
/// only happens when the resolving worker died.
#[derive(Debug)]
pub struct CompletionFuture<T> {
    id: u64,
    rx: oneshot::Receiver<T>,
}

impl<T> CompletionFuture<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block the current thread until the completion is resolved
    ///
    /// Must not be called from within an async context.
    pub fn wait(self) -> Option<T> {
        futures::executor::block_on(self)
    }

    /// Return the value if it has been resolved already
    pub fn try_take(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Future for CompletionFuture<T> {
    type Output = Option<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(value)) => Poll::Ready(Some(value)),
            Poll::Ready(Err(_)) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

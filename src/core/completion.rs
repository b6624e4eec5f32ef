/// Single-resolution completion handles
///
/// Every asynchronous operation hands its caller a `CompletionHandle` and keeps the
/// matching `Completer`. `Completer::resolve` consumes the completer, so an operation
/// cannot complete twice. A completer dropped without resolving (its connection task
/// went away) resolves the handle with `AlacenaError::Closed`.
use crate::error::{AlacenaError, AlacenaResult};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Create a linked completer/handle pair
pub fn completion<T>() -> (Completer<T>, CompletionHandle<T>) {
    let (tx, rx) = oneshot::channel();
    (Completer { tx }, CompletionHandle { rx })
}

/// Producer side, held by whoever will learn the outcome
#[derive(Debug)]
pub struct Completer<T> {
    tx: oneshot::Sender<AlacenaResult<T>>,
}

impl<T> Completer<T> {
    /// Resolve the operation. Returns false if the caller stopped listening.
    pub fn resolve(self, outcome: AlacenaResult<T>) -> bool {
        self.tx.send(outcome).is_ok()
    }

    pub fn succeed(self, value: T) -> bool {
        self.resolve(Ok(value))
    }

    pub fn fail(self, error: AlacenaError) -> bool {
        self.resolve(Err(error))
    }

    /// True once the handle has been dropped
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side; a future resolving exactly once
#[derive(Debug)]
#[must_use = "a completion handle does nothing unless awaited"]
pub struct CompletionHandle<T> {
    rx: oneshot::Receiver<AlacenaResult<T>>,
}

impl<T> CompletionHandle<T> {
    /// A handle that is already resolved, used for failures detected before any I/O
    pub fn ready(outcome: AlacenaResult<T>) -> Self {
        let (completer, handle) = completion();
        completer.resolve(outcome);
        handle
    }

    /// Non-blocking check; `None` while the operation is still in flight.
    ///
    /// Taking the outcome consumes it; do not await the handle afterwards.
    pub fn try_take(&mut self) -> Option<AlacenaResult<T>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(AlacenaError::Closed)),
        }
    }

    /// Transform the successful value once it arrives
    pub async fn map<U, F>(self, f: F) -> AlacenaResult<U>
    where
        F: FnOnce(T) -> AlacenaResult<U>,
    {
        self.await.and_then(f)
    }
}

impl<T> Future for CompletionHandle<T> {
    type Output = AlacenaResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(Err(AlacenaError::Closed)))
    }
}

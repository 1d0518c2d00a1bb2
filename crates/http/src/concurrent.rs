//! Futures glue: single-assignment result slots and timeouts.
//!
//! A [`Deferred`] is the writing half of a one-shot result slot and a [`DeferredReceiver`] is the
//! awaiting half. The slot is resolved at most once: a second `resolve` hands the value back.
//! Dropping the [`Deferred`] without resolving wakes the receiver with [`Abandoned`].

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::channel::oneshot;
use thiserror::Error;

/// Creates a connected result slot.
pub fn deferred<T>() -> (Deferred<T>, DeferredReceiver<T>) {
    let (tx, rx) = oneshot::channel();
    (Deferred { tx: Some(tx) }, DeferredReceiver { rx })
}

/// The resolving half of a result slot.
pub struct Deferred<T> {
    tx: Option<oneshot::Sender<T>>,
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred").field("resolved", &self.is_resolved()).finish()
    }
}

impl<T> Deferred<T> {
    /// Resolves the slot with `value`.
    ///
    /// Returns the value back when the slot was already resolved. A receiver that was dropped
    /// in the meantime does not count as an error: nobody is interested in the result anymore.
    pub fn resolve(&mut self, value: T) -> Result<(), T> {
        match self.tx.take() {
            Some(tx) => {
                let _ = tx.send(value);
                Ok(())
            }
            None => Err(value),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.is_none()
    }
}

/// The awaiting half of a result slot.
#[derive(Debug)]
pub struct DeferredReceiver<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for DeferredReceiver<T> {
    type Output = Result<T, Abandoned>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| result.map_err(|oneshot::Canceled| Abandoned))
    }
}

/// The resolving half was dropped before a value was supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("result slot was dropped without being resolved")]
pub struct Abandoned;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation timed out after {after:?}")]
pub struct TimeoutError {
    pub after: Duration,
}

/// Awaits `future`, failing with [`TimeoutError`] when `timeout` elapses first.
///
/// `None` waits forever. The wrapped future is dropped on timeout, which cancels it.
pub async fn with_timeout<F>(timeout: Option<Duration>, future: F) -> Result<F::Output, TimeoutError>
where
    F: Future,
{
    match timeout {
        Some(after) => tokio::time::timeout(after, future).await.map_err(|_elapsed| TimeoutError { after }),
        None => Ok(future.await),
    }
}

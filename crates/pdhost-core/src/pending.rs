//! Completion handles for work that finishes on a background thread

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot::{self, error::TryRecvError};

use crate::error::{HostError, HostResult};
use crate::types::{InstanceId, PatchId};

/// Result of an asynchronous `create`
pub type PendingInstance = Pending<InstanceId>;

/// Result of an asynchronous patch `open`
pub type PendingPatch = Pending<PatchId>;

/// A result that is delivered once, from another thread
///
/// Await it from async code, poll it with [`Pending::try_result`] from a
/// UI/control loop, or block on it with [`Pending::wait`].
#[derive(Debug)]
pub struct Pending<T> {
    what: &'static str,
    rx: oneshot::Receiver<HostResult<T>>,
}

impl<T> Pending<T> {
    pub(crate) fn channel(what: &'static str) -> (oneshot::Sender<HostResult<T>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { what, rx })
    }

    /// Block until the result arrives
    ///
    /// Must not be called from inside an async runtime; await instead.
    pub fn wait(self) -> HostResult<T> {
        let what = self.what;
        self.rx.blocking_recv().unwrap_or_else(|_| Err(dropped(what)))
    }

    /// The result if it has arrived, without blocking
    pub fn try_result(&mut self) -> Option<HostResult<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(dropped(self.what))),
        }
    }

    /// The raw oneshot receiver, for callers that select over several channels
    pub fn into_receiver(self) -> oneshot::Receiver<HostResult<T>> {
        self.rx
    }
}

impl<T> Future for Pending<T> {
    type Output = HostResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let what = self.what;
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or_else(|_| Err(dropped(what))))
    }
}

fn dropped(what: &str) -> HostError {
    HostError::ServiceUnavailable(format!("{} was dropped before completing", what))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_receives_result() {
        let (tx, pending) = PendingInstance::channel("create");
        std::thread::spawn(move || {
            let _ = tx.send(Ok(4));
        });
        assert_eq!(pending.wait().unwrap(), 4);
    }

    #[test]
    fn test_try_result() {
        let (tx, mut pending) = PendingPatch::channel("open");
        assert!(pending.try_result().is_none());
        tx.send(Ok(1)).unwrap();
        assert!(matches!(pending.try_result(), Some(Ok(1))));
    }

    #[test]
    fn test_dropped_sender_is_service_unavailable() {
        let (tx, pending) = PendingPatch::channel("open");
        drop(tx);
        assert!(matches!(
            pending.wait(),
            Err(HostError::ServiceUnavailable(_))
        ));
    }

    #[test]
    fn test_await_on_runtime() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let (tx, pending) = PendingInstance::channel("create");
        tx.send(Ok(2)).unwrap();
        assert_eq!(runtime.block_on(pending).unwrap(), 2);
    }
}

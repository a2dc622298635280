use super::Index;
use crate::error::{Error, Result};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// A one-shot result of an asynchronous operation. The operation is carried
/// out by the node's threads and the result is delivered once. If the node
/// drops the operation without responding (e.g. because it shut down), the
/// future resolves with Error::RaftShutdown.
#[must_use = "futures must be waited on to observe the result"]
pub struct Future<T> {
    rx: Receiver<Result<T>>,
}

impl<T> Future<T> {
    /// Creates a new future and its responder.
    pub(crate) fn new() -> (Self, Responder<T>) {
        let (tx, rx) = crossbeam::channel::bounded(1);
        (Self { rx }, Responder { tx })
    }

    /// Creates a future that is already resolved.
    pub(crate) fn ready(result: Result<T>) -> Self {
        let (future, responder) = Self::new();
        responder.respond(result);
        future
    }

    /// Blocks until the result is available.
    pub fn wait(self) -> Result<T> {
        self.rx.recv().unwrap_or(Err(Error::RaftShutdown))
    }

    /// Blocks until the result is available or the timeout elapses, in which
    /// case the future is returned for another attempt.
    pub fn wait_timeout(self, timeout: Duration) -> std::result::Result<Result<T>, Self> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Ok(result),
            Err(RecvTimeoutError::Disconnected) => Ok(Err(Error::RaftShutdown)),
            Err(RecvTimeoutError::Timeout) => Err(self),
        }
    }

    /// Returns the result if it is available, without blocking.
    pub fn try_wait(&self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(crossbeam::channel::TryRecvError::Empty) => None,
            Err(crossbeam::channel::TryRecvError::Disconnected) => Some(Err(Error::RaftShutdown)),
        }
    }
}

/// Delivers the result of a Future.
pub(crate) struct Responder<T> {
    tx: Sender<Result<T>>,
}

impl<T> Responder<T> {
    /// Delivers the result. The caller may have dropped the future, which is
    /// fine.
    pub fn respond(self, result: Result<T>) {
        let _ = self.tx.send(result);
    }
}

impl<T> std::fmt::Debug for Responder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Responder")
    }
}

/// The result of an applied log entry: its index and the FSM's response.
/// Entries that are not applied to the FSM (e.g. barriers and
/// configurations) have an empty response.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Applied {
    pub index: Index,
    pub response: Vec<u8>,
}

/// A future for applied entries: Apply, ApplyLog, Barrier and membership
/// changes.
pub type ApplyFuture = Future<Applied>;

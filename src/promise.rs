use crate::error::Error;
use crate::types::Value;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;

/// The result delivered to a [Promise].
pub type ReplyResult = Result<Value, Error>;

/// A caller-supplied continuation for one or more requests.
///
/// `resolve` is called exactly once per submitted index, with either the
/// response value or an error. Cancellation is only polled before a request is
/// enqueued; once a request is on the wire its response is always delivered.
pub trait Promise: Send + Sync + 'static {
  /// Whether the caller already gave up on the result.
  fn is_cancelled(&self) -> bool {
    false
  }

  /// Deliver the result for the request submitted at `index`.
  fn resolve(&self, result: ReplyResult, index: u64);
}

/// Sentinel promise for marker requests (ASKING, MULTI, EXEC) whose replies
/// are read off the wire and discarded.
pub(crate) struct Dumb;

impl Promise for Dumb {
  fn resolve(&self, _: ReplyResult, _: u64) {}
}

lazy_static! {
  pub(crate) static ref DUMB: Arc<Dumb> = Arc::new(Dumb);
}

/// A one-shot channel adapter for callers that want to await a single reply.
///
/// Dropping the receiver marks the promise cancelled, so a request that has
/// not been enqueued yet resolves immediately with a cancellation error.
pub struct OneshotPromise {
  tx: Mutex<Option<oneshot::Sender<(ReplyResult, u64)>>>,
}

impl OneshotPromise {
  pub fn new() -> (Arc<OneshotPromise>, oneshot::Receiver<(ReplyResult, u64)>) {
    let (tx, rx) = oneshot::channel();
    let promise = Arc::new(OneshotPromise {
      tx: Mutex::new(Some(tx)),
    });
    (promise, rx)
  }
}

impl Promise for OneshotPromise {
  fn is_cancelled(&self) -> bool {
    self.tx.lock().as_ref().map(|tx| tx.is_closed()).unwrap_or(true)
  }

  fn resolve(&self, result: ReplyResult, index: u64) {
    if let Some(tx) = self.tx.lock().take() {
      let _ = tx.send((result, index));
    }
  }
}

/// Wraps the caller's promise for a transaction so only the EXEC reply at
/// index `len` is forwarded; the MULTI marker and the intermediate QUEUED
/// replies are dropped on the floor.
pub(crate) struct TransactionPromise {
  inner: Arc<dyn Promise>,
  len: u64,
  offset: u64,
}

impl TransactionPromise {
  pub fn new(inner: Arc<dyn Promise>, len: u64, offset: u64) -> Self {
    TransactionPromise { inner, len, offset }
  }
}

impl Promise for TransactionPromise {
  fn is_cancelled(&self) -> bool {
    self.inner.is_cancelled()
  }

  fn resolve(&self, result: ReplyResult, index: u64) {
    if index == self.len {
      self.inner.resolve(result, self.offset);
    }
  }
}

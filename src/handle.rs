//! Per-call outcome handles and their one-shot settlement.

use std::borrow::Cow;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use futures::Future;
use tokio::sync::oneshot;
use tracing::debug;

use crate::common::AbortFn;

/// Rejection payload delivered to a handle that was aborted before its
/// operation produced an outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortPayload {
    /// Short status text, `"abort"` unless configured otherwise.
    pub status_text: Cow<'static, str>,
}

impl AbortPayload {
    /// Payload with the given status text.
    pub fn new(status_text: impl Into<Cow<'static, str>>) -> Self {
        Self {
            status_text: status_text.into(),
        }
    }
}

impl Default for AbortPayload {
    fn default() -> Self {
        Self::new("abort")
    }
}

impl fmt::Display for AbortPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.status_text)
    }
}

/// Why a paced call did not deliver a success value.
#[derive(Debug, thiserror::Error)]
pub enum CallError<E> {
    /// The handle was aborted before the operation delivered an outcome.
    /// Carries the wrapper's configured abort payload.
    #[error("call aborted: {0}")]
    Aborted(AbortPayload),
    /// The operation itself failed; the reason is passed through verbatim.
    #[error("operation failed: {0}")]
    Failed(E),
    /// The operation panicked, either on its calling stack or inside its
    /// in-flight future. The drain loop keeps going regardless.
    #[error("operation panicked: {0}")]
    Panicked(String),
}

/// Shared settlement cell behind a [`CallHandle`].
///
/// The pacer holds one end (to settle and to check the aborted flag when
/// the record is popped), the handle holds the other. Settlement is
/// first-write-wins: the sender is taken out of the cell exactly once,
/// every later attempt is a no-op.
pub(crate) struct OutcomeCell<T, E, X> {
    tx: Mutex<Option<oneshot::Sender<Result<T, CallError<E>>>>>,
    aborted: AtomicBool,
    abort_hook: Mutex<Option<AbortFn>>,
    transport: Mutex<Option<X>>,
    aborted_response: AbortPayload,
}

pub(crate) fn relock<T>(result: Result<T, PoisonError<T>>) -> T {
    // A panicking operation must not wedge settlement for its caller.
    result.unwrap_or_else(PoisonError::into_inner)
}

impl<T, E, X> OutcomeCell<T, E, X> {
    /// Create the cell plus the caller-facing handle wired to it.
    pub(crate) fn new_pair(aborted_response: AbortPayload) -> (Arc<Self>, CallHandle<T, E, X>) {
        let (tx, rx) = oneshot::channel();
        let cell = Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            aborted: AtomicBool::new(false),
            abort_hook: Mutex::new(None),
            transport: Mutex::new(None),
            aborted_response,
        });
        let handle = CallHandle {
            rx,
            cell: Arc::clone(&cell),
        };
        (cell, handle)
    }

    /// Deliver the outcome. Returns false if the cell was already settled.
    pub(crate) fn settle(&self, outcome: Result<T, CallError<E>>) -> bool {
        match relock(self.tx.lock()).take() {
            Some(tx) => {
                // A dropped receiver just means nobody is waiting anymore.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Reject with the configured abort payload, flag the record so the
    /// drain loop skips it, and delegate to a bridged abort callback if
    /// the record has already been dispatched.
    pub(crate) fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        if self.settle(Err(CallError::Aborted(self.aborted_response.clone()))) {
            debug!(payload = %self.aborted_response, "call aborted");
        }
        let hook = relock(self.abort_hook.lock()).clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Copy an in-flight operation's abort callback and transport handle
    /// onto this cell. Called once, when the record is dispatched.
    pub(crate) fn bridge(&self, abort: Option<AbortFn>, transport: Option<X>) {
        if let Some(abort) = abort {
            *relock(self.abort_hook.lock()) = Some(abort);
        }
        if let Some(transport) = transport {
            *relock(self.transport.lock()) = Some(transport);
        }
    }

    fn aborted_response(&self) -> &AbortPayload {
        &self.aborted_response
    }
}

/// The future returned by every paced call.
///
/// Resolves with the operation's own outcome once the call has been drained
/// and the operation finished. Before that it is pending, and it can be
/// given up on with [`CallHandle::abort`]:
///
/// - aborted while still queued: the operation is never invoked and the
///   handle rejects with the wrapper's [`AbortPayload`];
/// - aborted after dispatch: the handle rejects locally all the same, and
///   the local rejection wins even if the in-flight operation later
///   succeeds. If the operation attached an abort callback via
///   [`crate::common::InFlight::abort_with`], it is invoked too.
pub struct CallHandle<T, E, X = ()> {
    rx: oneshot::Receiver<Result<T, CallError<E>>>,
    cell: Arc<OutcomeCell<T, E, X>>,
}

impl<T, E, X> CallHandle<T, E, X> {
    /// Abort this call. Safe to invoke at any point; settlement is
    /// first-write-wins, so aborting an already settled call changes
    /// nothing.
    pub fn abort(&self) {
        self.cell.abort();
    }

    /// Whether [`CallHandle::abort`] was invoked on this handle.
    pub fn is_aborted(&self) -> bool {
        self.cell.is_aborted()
    }
}

impl<T, E, X: Clone> CallHandle<T, E, X> {
    /// The transport handle attached by the operation, if any.
    ///
    /// Present only once the call has been dispatched and the operation
    /// returned an in-flight record carrying one; `None` while the call is
    /// still queued.
    pub fn transport(&self) -> Option<X> {
        relock(self.cell.transport.lock()).clone()
    }
}

impl<T, E, X> Future for CallHandle<T, E, X> {
    type Output = Result<T, CallError<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // The pacer dropped the record without settling it (e.g. the
            // wrapper itself was dropped); surface that as an abort.
            Poll::Ready(Err(_)) => Poll::Ready(Err(CallError::Aborted(
                this.cell.aborted_response().clone(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

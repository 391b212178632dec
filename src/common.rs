//! Module containing the dispatch types shared by operations and the pacer.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::Future;

/// Abort callback copied from an in-flight operation onto the caller's
/// handle. Invoked at most once, from whichever thread calls `abort()`.
pub type AbortFn = Arc<dyn Fn() + Send + Sync>;

/// What one invocation of a paced operation produced.
///
/// This is the explicit capability split between "plain value" and
/// "future-like object": a `Ready` dispatch settles the caller's handle
/// immediately, while a `Pending` dispatch is bridged, so the inner
/// future's eventual outcome settles the handle with the same value or
/// reason.
pub enum Dispatch<T, E, X = ()> {
    /// The operation completed on the calling stack.
    Ready(Result<T, E>),
    /// The operation started asynchronous work; see [`InFlight`].
    Pending(InFlight<T, E, X>),
}

impl<T, E, X> Dispatch<T, E, X> {
    /// A synchronously produced success value.
    pub fn ready(value: T) -> Self {
        Self::Ready(Ok(value))
    }

    /// A synchronously produced failure.
    pub fn failed(error: E) -> Self {
        Self::Ready(Err(error))
    }

    /// Asynchronous work with no abort capability or transport handle.
    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self::Pending(InFlight::new(future))
    }
}

/// An operation's asynchronous side: the future that will deliver its
/// outcome, plus whatever the operation exposes for in-flight control.
///
/// The optional abort callback and transport handle are copied onto the
/// caller's [`crate::handle::CallHandle`] when the record is dispatched,
/// so the caller can cancel the underlying work or inspect its transport
/// without ever seeing the inner future.
pub struct InFlight<T, E, X = ()> {
    pub(crate) future: BoxFuture<'static, Result<T, E>>,
    pub(crate) abort: Option<AbortFn>,
    pub(crate) transport: Option<X>,
}

impl<T, E, X> InFlight<T, E, X> {
    /// Wrap the future that produces this operation's outcome.
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            future: Box::pin(future),
            abort: None,
            transport: None,
        }
    }

    /// Attach an abort callback. Once this record is dispatched, calling
    /// `abort()` on the caller's handle delegates here as well.
    pub fn abort_with<F>(mut self, abort: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.abort = Some(Arc::new(abort));
        self
    }

    /// Attach a transport handle the caller may inspect once the record
    /// is dispatched, e.g. a request id or the underlying connection.
    pub fn transport(mut self, transport: X) -> Self {
        self.transport = Some(transport);
        self
    }
}

impl<T, E, X> From<InFlight<T, E, X>> for Dispatch<T, E, X> {
    fn from(in_flight: InFlight<T, E, X>) -> Self {
        Self::Pending(in_flight)
    }
}

//! The wrapper factory and its timed drain loop.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::time;
use tracing::{debug, trace};

use crate::common::{Dispatch, InFlight};
use crate::handle::{relock, AbortPayload, CallError, CallHandle, OutcomeCell};

/// When a drained record's operation is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartMode {
    /// Invoke on the drain tick's own stack.
    #[default]
    Inline,
    /// Push the invocation onto a freshly spawned task, decoupling it from
    /// the drain tick. Use this when a synchronously completing operation
    /// may re-enter the wrapper.
    Overlapped,
}

/// Per-wrapper configuration.
#[derive(Debug, Clone, Default)]
pub struct PaceOptions {
    /// Invocation timing, [`StartMode::Inline`] unless overridden.
    pub start: StartMode,
    /// Rejection payload for aborted calls, `"abort"` unless overridden.
    pub aborted_response: AbortPayload,
}

impl PaceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select [`StartMode::Overlapped`] invocation timing.
    pub fn overlapped(mut self) -> Self {
        self.start = StartMode::Overlapped;
        self
    }

    /// Replace the rejection payload delivered to aborted calls.
    pub fn aborted_response(mut self, payload: AbortPayload) -> Self {
        self.aborted_response = payload;
        self
    }
}

type BoxOp<A, T, E, X> = Box<dyn FnMut(A) -> Dispatch<T, E, X> + Send>;

/// One deferred call: the argument snapshot plus the settlement cell the
/// caller's handle is wired to. Enqueued once, dequeued once, settled once.
struct Request<A, T, E, X> {
    args: A,
    outcome: Arc<OutcomeCell<T, E, X>>,
}

struct DrainState<A, T, E, X> {
    queue: VecDeque<Request<A, T, E, X>>,
    /// True while a drain task is alive. At most one drain task exists per
    /// wrapper at any time.
    draining: bool,
}

struct Shared<A, T, E, X> {
    rate_ns: AtomicU64,
    mode: StartMode,
    aborted_response: AbortPayload,
    op: Mutex<BoxOp<A, T, E, X>>,
    state: Mutex<DrainState<A, T, E, X>>,
}

/// A rate-limited, serializing version of an arbitrary callable.
///
/// Wrapping an operation yields a callable with the same inputs whose
/// invocations are spaced at least `rate` apart, in strict FIFO order, with
/// no call ever dropped. Each [`Paced::call`] returns a
/// [`CallHandle`] immediately; the operation runs when its turn is drained.
///
/// The spacing bounds the *start-to-start* interval of consecutive
/// operations, not completion-to-start: an operation that answers with an
/// in-flight future does not hold up the next tick, so several slow
/// operations may overlap.
///
/// Cloning is cheap and clones share the same queue, so one wrapper can be
/// handed to many logical callers while all their calls stay serialized.
///
/// ```rust
/// use std::time::Duration;
///
/// use futures_pacer::common::Dispatch;
/// use futures_pacer::pacer::Paced;
///
/// let paced = Paced::new(
///     |n: u32| Dispatch::<u32, String>::ready(n * 2),
///     Duration::from_millis(5),
/// );
///
/// tokio_test::block_on(async move {
///     let first = paced.call(2);
///     let second = paced.call(3);
///     assert_eq!(first.await.unwrap(), 4);
///     assert_eq!(second.await.unwrap(), 6);
/// });
/// ```
pub struct Paced<A, T, E, X = ()> {
    shared: Arc<Shared<A, T, E, X>>,
}

impl<A, T, E, X> Clone for Paced<A, T, E, X> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<A, T, E, X> Paced<A, T, E, X>
where
    A: Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
    X: Send + 'static,
{
    /// Wrap `op` so consecutive invocations start at least `rate` apart.
    ///
    /// Default options: [`StartMode::Inline`] invocation and the `"abort"`
    /// rejection payload. A zero `rate` keeps the queueing and FIFO
    /// guarantees but inserts no delay between starts.
    pub fn new<Op>(op: Op, rate: Duration) -> Self
    where
        Op: FnMut(A) -> Dispatch<T, E, X> + Send + 'static,
    {
        Self::with_options(op, rate, PaceOptions::default())
    }

    /// Wrap `op` with explicit [`PaceOptions`].
    ///
    /// ```rust
    /// use std::time::Duration;
    ///
    /// use futures_pacer::common::Dispatch;
    /// use futures_pacer::handle::{AbortPayload, CallError};
    /// use futures_pacer::pacer::{PaceOptions, Paced};
    ///
    /// let paced = Paced::with_options(
    ///     |n: u32| Dispatch::<u32, String>::ready(n),
    ///     Duration::from_millis(50),
    ///     PaceOptions::new().aborted_response(AbortPayload::new("cancelled")),
    /// );
    ///
    /// tokio_test::block_on(async move {
    ///     let first = paced.call(1);
    ///     let second = paced.call(2);
    ///     // Give up on the queued call before its turn comes: its
    ///     // operation is never invoked.
    ///     second.abort();
    ///     assert_eq!(first.await.unwrap(), 1);
    ///     match second.await {
    ///         Err(CallError::Aborted(payload)) => {
    ///             assert_eq!(payload.status_text, "cancelled")
    ///         }
    ///         other => panic!("unexpected outcome: {other:?}"),
    ///     }
    /// });
    /// ```
    pub fn with_options<Op>(op: Op, rate: Duration, options: PaceOptions) -> Self
    where
        Op: FnMut(A) -> Dispatch<T, E, X> + Send + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                rate_ns: AtomicU64::new(duration_to_ns(rate)),
                mode: options.start,
                aborted_response: options.aborted_response,
                op: Mutex::new(Box::new(op)),
                state: Mutex::new(DrainState {
                    queue: VecDeque::new(),
                    draining: false,
                }),
            }),
        }
    }

    /// Queue one invocation and return its outcome handle immediately.
    ///
    /// Never blocks and never fails at call time; every failure mode is
    /// deferred into the handle's eventual rejection.
    ///
    /// Panics if invoked outside a Tokio runtime: an idle wrapper starts
    /// its drain task here.
    pub fn call(&self, args: A) -> CallHandle<T, E, X> {
        let (cell, handle) = OutcomeCell::new_pair(self.shared.aborted_response.clone());
        let start_drain = {
            let mut state = relock(self.shared.state.lock());
            state.queue.push_back(Request {
                args,
                outcome: cell,
            });
            debug!(queued = state.queue.len(), "call enqueued");
            !std::mem::replace(&mut state.draining, true)
        };
        if start_drain {
            drain(Arc::clone(&self.shared));
        }
        handle
    }

    /// Change the spacing at runtime.
    ///
    /// **IMPORTANT**: the new rate won't be applied until the next drain
    /// tick is scheduled; a tick already sleeping keeps its old delay.
    pub fn set_rate(&self, rate: Duration) {
        self.shared.rate_ns.store(duration_to_ns(rate), Ordering::Relaxed);
    }

    /// The current spacing between consecutive starts.
    pub fn rate(&self) -> Duration {
        self.shared.rate()
    }

    /// Number of calls waiting for their turn (not counting one already
    /// handed to the current tick).
    pub fn queued(&self) -> usize {
        relock(self.shared.state.lock()).queue.len()
    }

    /// True when the queue is empty and no drain task is alive. An idle
    /// wrapper holds no pending timers.
    pub fn is_idle(&self) -> bool {
        !relock(self.shared.state.lock()).draining
    }

    /// Abort and discard every queued call without invoking its operation.
    /// Each discarded handle rejects with the configured abort payload.
    /// Returns how many calls were discarded.
    pub fn clear(&self) -> usize {
        let discarded: Vec<_> = {
            let mut state = relock(self.shared.state.lock());
            state.queue.drain(..).collect()
        };
        for request in &discarded {
            request.outcome.abort();
        }
        debug!(discarded = discarded.len(), "queue cleared");
        discarded.len()
    }
}

impl<A, T, E, X> Shared<A, T, E, X>
where
    A: Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
    X: Send + 'static,
{
    fn rate(&self) -> Duration {
        Duration::from_nanos(self.rate_ns.load(Ordering::Relaxed))
    }

    /// Pop the next live record. Aborted records are discarded on the spot
    /// (their handles were already settled by the abort) and consume no
    /// rate slot. An empty queue flips the wrapper back to idle.
    ///
    /// This is an explicit loop rather than a recursive skip so a long run
    /// of consecutive aborts cannot grow the stack.
    fn pop_live(&self) -> Option<Request<A, T, E, X>> {
        let mut state = relock(self.state.lock());
        loop {
            match state.queue.pop_front() {
                Some(request) if request.outcome.is_aborted() => {
                    trace!("discarding aborted record");
                    continue;
                }
                Some(request) => return Some(request),
                None => {
                    state.draining = false;
                    debug!("queue empty, pacer idle");
                    return None;
                }
            }
        }
    }

    /// Invoke one record's operation and wire its outcome into the
    /// caller's handle. Panics on the operation's calling stack are caught
    /// and turned into rejections so the drain loop outlives them.
    fn dispatch(&self, request: Request<A, T, E, X>) {
        let Request { args, outcome } = request;
        let produced = {
            let mut op = relock(self.op.lock());
            catch_unwind(AssertUnwindSafe(|| (*op)(args)))
        };
        match produced {
            Ok(Dispatch::Ready(result)) => {
                outcome.settle(result.map_err(CallError::Failed));
            }
            Ok(Dispatch::Pending(in_flight)) => {
                let InFlight {
                    future,
                    abort,
                    transport,
                } = in_flight;
                // The handle gains the operation's own abort and transport
                // before anything can race to settle it.
                outcome.bridge(abort, transport);
                trace!("bridging in-flight operation");
                tokio::spawn(async move {
                    match AssertUnwindSafe(future).catch_unwind().await {
                        Ok(result) => outcome.settle(result.map_err(CallError::Failed)),
                        Err(panic) => {
                            outcome.settle(Err(CallError::Panicked(panic_text(panic.as_ref()))))
                        }
                    };
                });
            }
            Err(panic) => {
                outcome.settle(Err(CallError::Panicked(panic_text(panic.as_ref()))));
            }
        }
    }
}

/// Run the drain loop until the queue empties.
///
/// One tick: pop the next live record, start it per [`StartMode`], then
/// sleep the configured rate. The delay is inserted after *starting* an
/// execution, not after it completes, so the rate bounds the
/// start-to-start interval regardless of how long each operation takes.
fn drain<A, T, E, X>(shared: Arc<Shared<A, T, E, X>>)
where
    A: Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
    X: Send + 'static,
{
    debug!("starting drain task");
    tokio::spawn(async move {
        while let Some(request) = shared.pop_live() {
            match shared.mode {
                StartMode::Inline => shared.dispatch(request),
                StartMode::Overlapped => {
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move { shared.dispatch(request) });
                }
            }
            time::sleep(shared.rate()).await;
        }
    });
}

fn duration_to_ns(rate: Duration) -> u64 {
    u64::try_from(rate.as_nanos()).unwrap_or(u64::MAX)
}

fn panic_text(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "opaque panic payload".to_owned()
    }
}

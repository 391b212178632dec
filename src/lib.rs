//! Rate-limited serializing wrapper for sync and async callables
//!
//! This crate wraps an arbitrary operation so that invocations are spaced at
//! least a fixed interval apart, while every call is queued and none are
//! dropped.
//!
//! Plain `tokio::time::interval` or token buckets tell you *when* you may
//! proceed, but they leave the bookkeeping to you: you still have to queue
//! the calls yourself, hand each caller something to await, and decide what
//! happens to calls that were given up on before their turn came. That means
//! extra channels, extra tasks, and added overhead for what is conceptually
//! one thing: "run these calls in order, no faster than one every N
//! milliseconds".
//!
//! This crate provides exactly that. Wrapping an operation with
//! [`pacer::Paced`] gives you a callable with the same inputs and outputs,
//! except each call returns a [`handle::CallHandle`] immediately. Calls drain
//! strictly in FIFO order with the configured spacing between consecutive
//! *starts*: the limiter throttles initiation rate, not concurrency, so slow
//! overlapping operations may be in flight at once. A handle can be aborted
//! before its turn, in which case the underlying operation is never invoked
//! and the skipped slot delays nobody.
//!
//! The logic is rather simple: calls are appended to a queue owned by the
//! wrapper, and a single drain task pops one record per tick, skips the
//! aborted ones, starts the live ones, and sleeps the configured rate before
//! the next pop. When the queue empties the task exits and the wrapper is
//! completely dormant (no timers, no background work).
//!
//! Make sure to check out the docs for examples!

pub mod common;
pub mod handle;
pub mod pacer;

//! bobbin is a cooperative threading runtime: logical threads interleave
//! over a single flow of control, suspending only at explicit points
//! (promises, waits, joins) and resuming through continuations.
//!
//! Threads act on behalf of [`Executor`]s, which serialise blocking work so
//! that only one thread at a time is "inside" an executor. Joins between
//! threads are checked for cycles, which are broken rather than left to
//! deadlock.

#[macro_use]
pub mod macros;

pub mod api;
mod deferred;
mod driver;
mod executor;
mod promise;
mod runtime;
mod signal;
mod task;
mod thread;
mod value;

pub use api::WaitTarget;
pub use deferred::{Deferred, DeferredCall};
pub use driver::{Call, ThreadFn};
pub use executor::{Executor, ExecutorId};
pub use promise::{Outcome, Promise, Resolver};
pub use runtime::{Priority, Scheduler, SchedulerConfig, SchedulerConfigBuilder};
pub use signal::{RuntimeError, Signal};
pub use task::{Computation, Coroutine, Ctx, Step};
pub use thread::{Status, Thread, ThreadId, WaitResolver};
pub use value::{Args, Value};

/// Final value of a computation body
pub fn done(value: impl Into<Value>) -> Outcome {
    Ok(value.into())
}

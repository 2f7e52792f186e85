//! Joins and turn-taking for the active thread

use crate::{
    ExecutorId, Promise, RuntimeError, Scheduler, Signal, Thread, ThreadFn, ThreadId, Value,
};

/// Something a thread can join
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitTarget {
    Thread(ThreadId),
    /// The last thread queued on the executor
    Executor(ExecutorId),
}

impl From<ThreadId> for WaitTarget {
    fn from(id: ThreadId) -> Self {
        WaitTarget::Thread(id)
    }
}

impl From<&Thread> for WaitTarget {
    fn from(thread: &Thread) -> Self {
        WaitTarget::Thread(thread.id())
    }
}

impl From<ExecutorId> for WaitTarget {
    fn from(id: ExecutorId) -> Self {
        WaitTarget::Executor(id)
    }
}

impl From<&crate::Executor> for WaitTarget {
    fn from(executor: &crate::Executor) -> Self {
        WaitTarget::Executor(executor.id())
    }
}

fn active(sched: &Scheduler) -> Result<Thread, RuntimeError> {
    sched.active().ok_or(RuntimeError::NoActiveThread)
}

/// Make the active thread join `target`. Returns `None` when there is
/// nothing to join: the executor queue is empty, or the active thread
/// already holds the executor's lock.
///
/// A join that would close a cycle of joins wakes the joined thread with
/// [`Value::CycleBroken`] instead of deadlocking
pub fn wait_for(
    sched: &Scheduler,
    target: WaitTarget,
    blocking: bool,
) -> Result<Option<Promise>, RuntimeError> {
    let current = active(sched)?;

    let joined = match target {
        WaitTarget::Thread(id) => sched.thread(id)?,
        WaitTarget::Executor(id) => {
            let executor = sched.executor_handle(id)?;
            if executor.locked_id() == Some(current.id()) {
                return Ok(None);
            }
            match executor.queue().last() {
                Some(last) => sched.thread(*last)?,
                None => return Ok(None),
            }
        }
    };

    current.set_waiting_for(Some(joined.id()));
    let target = joined.clone();
    let promise = current.wait(
        move |resolver| {
            target.after(move |outcome| {
                resolver.settle(outcome);
            })
        },
        blocking,
    );

    if joined.waiting_on(&current) {
        tracing::warn!(
            "Cyclic dependency between [{}] and [{}]",
            current.trace(false, None, &[]),
            joined.trace(false, None, &[])
        );
        joined.break_wait();
    }

    Ok(Some(promise))
}

/// Make the active thread wait for the next result of `function`. Fails
/// with [`Signal::Expired`] if the function's executor is already dead or
/// dies while waiting
pub fn wait_on(
    sched: &Scheduler,
    function: &ThreadFn,
    blocking: bool,
) -> Result<Promise, RuntimeError> {
    let current = active(sched)?;
    let function = function.clone();

    Ok(current.wait(
        move |resolver| {
            if function.is_expired() {
                resolver.fail(Signal::Expired);
            } else {
                function.listen(move |outcome| {
                    resolver.settle(outcome);
                });
            }
        },
        blocking,
    ))
}

/// Make the active thread wait for one scheduler turn
pub fn pass(sched: &Scheduler, blocking: bool) -> Result<Promise, RuntimeError> {
    let current = active(sched)?;
    let turn = sched.clone();

    Ok(current.wait(
        move |resolver| {
            turn.defer(move || {
                resolver.fulfil(Value::Unit);
            })
        },
        blocking,
    ))
}

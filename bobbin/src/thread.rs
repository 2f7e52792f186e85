//! Cooperative thread state machine
//!
//! A [`Thread`] is a handle into the scheduler's thread table. All
//! references between threads (parent, join target) are [`ThreadId`]s, so a
//! thread never owns another one.

use std::fmt::{Debug, Display};

use tracing::instrument;

use crate::{
    Computation, Executor, ExecutorId, Outcome, Promise, Resolver, RuntimeError, Scheduler,
    Signal, Value, driver, value::render_args,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ThreadId {
    key: usize,
    uid: u64,
}

impl ThreadId {
    pub(crate) fn new(key: usize, uid: u64) -> Self {
        Self { key, uid }
    }

    pub(crate) fn key(&self) -> usize {
        self.key
    }

    /// Monotonically increasing across a scheduler's lifetime
    pub fn uid(&self) -> u64 {
        self.uid
    }
}

impl Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.uid)
    }
}

#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    #[default]
    Ready,
    Active,
    Waiting,
    Finished,
    Stopped,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Finished | Status::Stopped)
    }

    pub fn allows(&self, next: Status) -> bool {
        use Status::*;
        matches!(
            (self, next),
            (Ready, Active)
                | (Ready, Stopped)
                | (Active, Active)
                | (Active, Waiting)
                | (Active, Finished)
                | (Active, Stopped)
                | (Waiting, Active)
                | (Waiting, Waiting)
                | (Waiting, Stopped)
        )
    }
}

pub(crate) struct WaitSlot {
    seq: u64,
    resolver: Resolver,
}

pub(crate) struct PauseGate {
    promise: Promise,
    resolver: Resolver,
}

pub(crate) struct ThreadState {
    pub(crate) uid: u64,
    name: String,
    owner: Option<ExecutorId>,
    pub(crate) parent: Option<ThreadId>,
    pub(crate) status: Status,
    stack: Vec<String>,
    completion: Promise,
    completion_resolver: Resolver,
    pub(crate) waiting_for: Option<ThreadId>,
    wait: Option<WaitSlot>,
    paused: Option<PauseGate>,
    reason: Option<Signal>,
}

impl ThreadState {
    pub(crate) fn new(
        uid: u64,
        name: &str,
        owner: Option<ExecutorId>,
        parent: Option<ThreadId>,
        completion: Promise,
        completion_resolver: Resolver,
    ) -> Self {
        Self {
            uid,
            name: name.to_owned(),
            owner,
            parent,
            status: Status::Ready,
            stack: Vec::new(),
            completion,
            completion_resolver,
            waiting_for: None,
            wait: None,
            paused: None,
            reason: None,
        }
    }

    fn transition(&mut self, next: Status) -> bool {
        if self.status.allows(next) {
            self.status = next;
            true
        } else {
            tracing::warn!(
                "Refusing thread {} transition {:?} -> {next:?}",
                self.name,
                self.status
            );
            false
        }
    }
}

/// Handle to one cooperative thread
#[derive(Clone)]
pub struct Thread {
    sched: Scheduler,
    id: ThreadId,
}

impl PartialEq for Thread {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("status", &self.status())
            .finish()
    }
}

impl Thread {
    pub(crate) fn new(sched: &Scheduler, id: ThreadId) -> Self {
        Self {
            sched: sched.clone(),
            id,
        }
    }

    fn with<R>(&self, f: impl FnOnce(&ThreadState) -> R) -> Option<R> {
        let threads = self.sched.threads().borrow();
        threads
            .get(self.id.key)
            .filter(|state| state.uid == self.id.uid)
            .map(f)
    }

    fn with_mut<R>(&self, f: impl FnOnce(&mut ThreadState) -> R) -> Option<R> {
        let mut threads = self.sched.threads().borrow_mut();
        threads
            .get_mut(self.id.key)
            .filter(|state| state.uid == self.id.uid)
            .map(f)
    }

    fn handle(&self, id: ThreadId) -> Thread {
        Thread::new(&self.sched, id)
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> String {
        self.with(|s| s.name.clone()).unwrap_or_default()
    }

    /// Threads missing from the table (reaped or reset) report as stopped
    pub fn status(&self) -> Status {
        self.with(|s| s.status).unwrap_or(Status::Stopped)
    }

    pub fn owner(&self) -> Option<ExecutorId> {
        self.with(|s| s.owner).flatten()
    }

    fn owner_executor(&self) -> Option<Executor> {
        self.owner().map(|id| Executor::new(&self.sched, id))
    }

    pub fn parent(&self) -> Option<ThreadId> {
        self.with(|s| s.parent).flatten()
    }

    pub fn stack(&self) -> Vec<String> {
        self.with(|s| s.stack.clone()).unwrap_or_default()
    }

    pub fn waiting_for(&self) -> Option<ThreadId> {
        self.with(|s| s.waiting_for).flatten()
    }

    pub fn is_paused(&self) -> bool {
        self.with(|s| s.paused.is_some()).unwrap_or(false)
    }

    /// Why the thread was stopped
    pub fn reason(&self) -> Option<Signal> {
        self.with(|s| s.reason.clone()).flatten()
    }

    /// Settled once the top level computation finishes or the thread is
    /// terminated
    pub fn completion(&self) -> Promise {
        match self.with(|s| s.completion.clone()) {
            Some(completion) => completion,
            None => self
                .sched
                .rejected(RuntimeError::UnknownThread(self.id).into()),
        }
    }

    pub fn after(&self, f: impl FnOnce(Outcome) + 'static) {
        self.completion().then(f);
    }

    pub fn error(&self, handler: impl FnOnce(Signal) + 'static) -> &Self {
        self.after(move |outcome| {
            if let Err(e) = outcome {
                handler(e);
            }
        });
        self
    }

    pub(crate) fn push_frame(&self, name: &str, args: &[Value]) {
        let frame = format!("{name}({})", render_args(args));
        self.with_mut(|s| s.stack.push(frame));
    }

    pub(crate) fn pop_frame(&self) {
        self.with_mut(|s| s.stack.pop());
    }

    pub(crate) fn activate(&self) {
        self.with_mut(|s| s.transition(Status::Active));
    }

    /// Run `computation` on this thread as a nested call named `name`
    pub(crate) fn run(&self, name: &str, computation: Box<dyn Computation>, args: &[Value]) -> Promise {
        self.push_frame(name, args);
        self.activate();

        let thread = self.clone();
        driver::run(&self.sched, computation, Some(self)).map(move |outcome| {
            thread.pop_frame();
            if let Err(e) = &outcome {
                thread.terminate(e.clone());
            }
            outcome
        })
    }

    pub(crate) fn start(&self, name: &str, computation: Box<dyn Computation>, args: &[Value]) {
        let thread = self.clone();
        self.run(name, computation, args)
            .then(move |outcome| match outcome {
                Ok(value) => thread.finish(value),
                Err(e) => thread.terminate(e),
            });
    }

    fn finish(&self, value: Value) {
        let Some(Some(completion)) = self.with_mut(|s| {
            if s.status.is_terminal() {
                return None;
            }
            s.transition(Status::Finished);
            Some(s.completion_resolver.clone())
        }) else {
            return;
        };

        self.unlock();
        completion.fulfil(value);
        tracing::trace!("Thread {} finished", self.id);
    }

    /// Idempotent: a thread is only ever terminated once
    pub(crate) fn terminate(&self, error: Signal) {
        let Some(Some((gate, completion))) = self.with_mut(|s| {
            if s.status.is_terminal() {
                return None;
            }
            s.transition(Status::Stopped);
            s.reason = Some(error.clone());
            Some((s.paused.take(), s.completion_resolver.clone()))
        }) else {
            return;
        };

        self.unlock();
        // the driver has to observe STOPPED, so a paused one must wake up
        if let Some(gate) = gate {
            gate.resolver.fulfil(());
        }
        completion.reject(error.clone());
        tracing::debug!("Thread {} stopped: {error}", self.id);
    }

    fn lock(&self) {
        if let Some(owner) = self.owner_executor() {
            owner.lock(self.id);
        }
    }

    fn unlock(&self) {
        if let Some(owner) = self.owner_executor() {
            owner.release(self.id);
        }
    }

    /// Fail the pending wait if there is one, otherwise terminate the thread
    #[instrument(skip(self), fields(thread = %self.id))]
    pub fn throw(&self, error: Signal) {
        let seq = self
            .with(|s| match (s.status, &s.wait) {
                (Status::Waiting, Some(slot)) => Some(slot.seq),
                _ => None,
            })
            .flatten();

        match seq {
            Some(seq) => {
                self.settle_wait(seq, Err(error));
            }
            None => self.terminate(error),
        }
    }

    /// Interrupt the thread. A pending wait is rejected with
    /// [`Signal::Interrupted`] and the thread leaves any executor queue
    #[instrument(skip(self), fields(thread = %self.id))]
    pub fn stop(&self) {
        let Some((waiting, slot)) = self.with_mut(|s| {
            let waiting = s.status == Status::Waiting;
            (waiting, if waiting { s.wait.take() } else { None })
        }) else {
            tracing::warn!("Stop requested for unknown thread {}", self.id);
            return;
        };

        if waiting {
            self.sched.unregister_waiting(self.id);
            self.wake();
        }

        self.terminate(Signal::Interrupted);

        if let Some(slot) = slot {
            slot.resolver.reject(Signal::Interrupted);
        }
    }

    /// Suspend the thread until `op` settles the [`WaitResolver`] it is
    /// handed. A blocking wait also queues the thread on its owner executor
    pub fn wait(&self, op: impl FnOnce(WaitResolver), blocking: bool) -> Promise {
        let (promise, resolver) = self.sched.promise("wait");
        let seq = self.sched.next_uid();

        let refused = self.with_mut(|s| {
            if s.status.is_terminal() {
                return Some(s.reason.clone().unwrap_or(RuntimeError::Terminated(self.id).into()));
            }
            s.transition(Status::Waiting);
            s.wait = Some(WaitSlot {
                seq,
                resolver: resolver.clone(),
            });
            None
        });

        match refused {
            None => {
                resolver.reject(RuntimeError::UnknownThread(self.id).into());
                return promise;
            }
            Some(Some(error)) => {
                resolver.reject(error);
                return promise;
            }
            Some(None) => {}
        }

        self.sched.register_waiting(self.id);
        if blocking {
            if let Some(owner) = self.owner_executor() {
                owner.enqueue(self);
            }
        }

        op(WaitResolver {
            thread: self.clone(),
            seq,
        });
        promise
    }

    pub fn block(&self, op: impl FnOnce(WaitResolver)) -> Promise {
        self.wait(op, true)
    }

    pub fn pause(&self) {
        if self.is_paused() {
            return;
        }
        let (promise, resolver) = self.sched.promise("pause");
        self.with_mut(|s| s.paused = Some(PauseGate { promise, resolver }));
    }

    pub fn resume(&self) {
        if let Some(Some(gate)) = self.with_mut(|s| s.paused.take()) {
            gate.resolver.fulfil(());
        }
    }

    pub(crate) fn pause_gate(&self) -> Option<Promise> {
        self.with(|s| s.paused.as_ref().map(|gate| gate.promise.clone()))
            .flatten()
    }

    pub(crate) fn set_waiting_for(&self, target: Option<ThreadId>) {
        self.with_mut(|s| s.waiting_for = target);
    }

    /// True if `other` is reachable through the chain of join targets
    pub fn waiting_on(&self, other: &Thread) -> bool {
        let mut seen = vec![self.id];
        let mut next = self.waiting_for();

        while let Some(id) = next {
            if id == other.id {
                return true;
            }
            if seen.contains(&id) {
                return false;
            }
            seen.push(id);
            next = self.handle(id).waiting_for();
        }
        false
    }

    /// Render the call chain of this thread, `owner: f() -> g(1)`, prefixed
    /// by the chain of the thread that spawned it. With `is_async` the chain
    /// of a joined thread is nested in `<<< [ ... ]`. Threads named in
    /// `names` render as their alias
    pub fn trace(
        &self,
        is_async: bool,
        async_parent: Option<ThreadId>,
        names: &[(String, ThreadId)],
    ) -> String {
        if let Some((alias, _)) = names.iter().find(|(_, id)| *id == self.id) {
            return alias.clone();
        }

        let Some((owner, parent, waiting_for, stack)) =
            self.with(|s| (s.owner, s.parent, s.waiting_for, s.stack.join(" -> ")))
        else {
            return String::new();
        };

        let mut out = match owner.map(|id| Executor::new(&self.sched, id).name()) {
            Some(owner) if !owner.is_empty() => format!("{owner}: {stack}"),
            _ => stack,
        };

        if is_async {
            if let Some(joined) = waiting_for {
                let nested = self.handle(joined).trace(true, Some(self.id), names);
                out.push_str(&format!(" <<< [ {nested} ]"));
            }
        }

        match parent {
            Some(parent) if Some(parent) == async_parent => format!("* ==> {out}"),
            Some(parent) => {
                let chain = self.handle(parent).trace(false, None, names);
                format!("{chain} ==> {out}")
            }
            None => out,
        }
    }

    pub(crate) fn settle_wait(&self, seq: u64, outcome: Outcome) -> bool {
        let resolver = self
            .with_mut(|s| {
                if s.status == Status::Stopped {
                    return None;
                }
                match &s.wait {
                    Some(slot) if slot.seq == seq => s.wait.take().map(|slot| slot.resolver),
                    _ => None,
                }
            })
            .flatten();

        let Some(resolver) = resolver else {
            tracing::trace!("Dropping stale settlement for thread {}", self.id);
            return false;
        };

        self.sched.unregister_waiting(self.id);
        self.wake();
        resolver.resolve(outcome)
    }

    fn wake(&self) {
        let owner = self
            .with_mut(|s| {
                s.waiting_for = None;
                s.wait = None;
                s.transition(Status::Active);
                s.owner
            })
            .flatten();

        if let Some(owner) = owner.map(|id| Executor::new(&self.sched, id)) {
            if owner.remove_queued(self.id) {
                self.lock();
            }
        }
    }

    /// Force the pending wait to resolve with [`Value::CycleBroken`]
    pub(crate) fn break_wait(&self) {
        let seq = self.with(|s| s.wait.as_ref().map(|slot| slot.seq)).flatten();
        if let Some(seq) = seq {
            self.settle_wait(seq, Ok(Value::CycleBroken));
        }
    }
}

/// Settles one specific wait of a thread. Settling after the thread has
/// been stopped, or after it moved on to another wait, is a no-op
#[derive(Clone)]
pub struct WaitResolver {
    thread: Thread,
    seq: u64,
}

impl Debug for WaitResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitResolver")
            .field("thread", &self.thread.id)
            .field("seq", &self.seq)
            .finish()
    }
}

impl WaitResolver {
    pub fn thread(&self) -> &Thread {
        &self.thread
    }

    pub fn settle(&self, outcome: Outcome) -> bool {
        self.thread.settle_wait(self.seq, outcome)
    }

    pub fn fulfil(&self, value: impl Into<Value>) -> bool {
        self.settle(Ok(value.into()))
    }

    pub fn fail(&self, error: Signal) -> bool {
        self.settle(Err(error))
    }
}

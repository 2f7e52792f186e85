//! Runtime driver: steps computations forward and decides, per call of a
//! thread function, whether the call continues on the caller's thread or
//! forks a new one

use std::{cell::RefCell, fmt::Debug, rc::Rc};

use crate::{
    Args, Computation, Executor, Outcome, Promise, Resolver, RuntimeError, Scheduler, Status,
    Step, Thread, Value,
};

pub(crate) type Listener = Box<dyn FnOnce(Outcome)>;

/// Once-only listeners registered against a [`ThreadFn`]
#[derive(Clone, Default)]
pub(crate) struct Listeners(Rc<RefCell<Vec<Listener>>>);

impl Listeners {
    pub(crate) fn push(&self, listener: Listener) {
        self.0.borrow_mut().push(listener);
    }

    pub(crate) fn drain(&self) -> Vec<Listener> {
        std::mem::take(&mut *self.0.borrow_mut())
    }

    pub(crate) fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub(crate) fn same(&self, other: &Listeners) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

type Factory = Box<dyn Fn(&Scheduler, Option<Executor>, Args) -> Box<dyn Computation>>;

struct FnInner {
    name: String,
    sched: Scheduler,
    factory: Factory,
    listeners: Listeners,
}

/// Callable returned by [`Scheduler::spawn`]
#[derive(Clone)]
pub struct ThreadFn {
    inner: Rc<FnInner>,
    receiver: Option<Executor>,
}

impl Debug for ThreadFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadFn")
            .field("name", &self.inner.name)
            .field("receiver", &self.receiver)
            .field("listeners", &self.inner.listeners.len())
            .finish()
    }
}

/// What a [`ThreadFn`] call turned into
#[derive(Debug, Clone)]
pub enum Call {
    /// A new thread was started for the call
    Forked(Thread),
    /// The call continues on the caller's thread, settled with its result
    Inline(Promise),
}

impl Call {
    pub fn thread(&self) -> Option<&Thread> {
        match self {
            Call::Forked(thread) => Some(thread),
            Call::Inline(_) => None,
        }
    }

    /// The forked thread's completion, or the inline result
    pub fn into_promise(self) -> Promise {
        match self {
            Call::Forked(thread) => thread.completion(),
            Call::Inline(promise) => promise,
        }
    }
}

impl ThreadFn {
    pub(crate) fn new(sched: &Scheduler, name: &str, factory: Factory) -> Self {
        Self {
            inner: Rc::new(FnInner {
                name: name.to_owned(),
                sched: sched.clone(),
                factory,
                listeners: Listeners::default(),
            }),
            receiver: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn receiver(&self) -> Option<&Executor> {
        self.receiver.as_ref()
    }

    /// Same function acting on `executor`. Listeners are shared with the
    /// unbound function, and expire when `executor` dies
    pub fn bind(&self, executor: &Executor) -> ThreadFn {
        executor.register_listeners(&self.inner.listeners);
        Self {
            inner: self.inner.clone(),
            receiver: Some(executor.clone()),
        }
    }

    /// Calls on a dead receiver can no longer be joined
    pub fn is_expired(&self) -> bool {
        self.receiver
            .as_ref()
            .is_some_and(|executor| !executor.is_alive())
    }

    pub fn call(&self, args: Args) -> Call {
        let sched = &self.inner.sched;
        let name = &self.inner.name;
        let computation = (self.inner.factory)(sched, self.receiver.clone(), args.clone());
        let receiver = self.receiver.as_ref().map(Executor::id);

        match sched.active() {
            Some(caller) if caller.owner() == receiver => {
                tracing::trace!("Continuing {name} inline on thread {}", caller.id());
                Call::Inline(caller.run(name, computation, &args))
            }
            caller => {
                let thread = sched.insert_thread(name, receiver, caller.map(|t| t.id()));
                tracing::trace!("Forking {name} as thread {}", thread.id());

                let function = self.clone();
                let observed = thread.clone();
                thread.after(move |outcome| {
                    if let Err(e) = &outcome {
                        tracing::warn!("Thread error [{}] {e}", observed.trace(false, None, &[]));
                    }
                    function.fire(outcome);
                });
                thread.start(name, computation, &args);
                Call::Forked(thread)
            }
        }
    }

    pub fn listen(&self, listener: impl FnOnce(Outcome) + 'static) {
        self.inner.listeners.push(Box::new(listener));
    }

    /// Promise for the outcome of the next forked call to finish
    pub fn next_result(&self) -> Promise {
        let (promise, resolver) = self.inner.sched.promise(&self.inner.name);
        self.listen(move |outcome| {
            resolver.resolve(outcome);
        });
        promise
    }

    /// Deliver `outcome` to every registered listener, then forget them
    pub fn fire(&self, outcome: Outcome) {
        for listener in self.inner.listeners.drain() {
            listener(outcome.clone());
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }
}

struct Drive {
    sched: Scheduler,
    thread: Thread,
    computation: RefCell<Box<dyn Computation>>,
    resolver: Resolver,
}

impl Drive {
    fn process(self: &Rc<Self>, input: Outcome) {
        let mut input = input;
        loop {
            if self.thread.status() == Status::Stopped {
                let reason = self
                    .thread
                    .reason()
                    .unwrap_or(RuntimeError::UnknownThread(self.thread.id()).into());
                self.resolver.reject(reason);
                return;
            }

            if let Some(gate) = self.thread.pause_gate() {
                let drive = self.clone();
                gate.then(move |_| drive.process(input));
                return;
            }

            self.sched.push_active(self.thread.id());
            self.thread.activate();
            let step = self.computation.borrow_mut().advance(input);
            self.sched.pop_active();

            match step {
                Step::Done(Ok(value)) => {
                    self.resolver.fulfil(value);
                    return;
                }
                Step::Done(Err(e)) => {
                    tracing::debug!("Uncaught failure on thread {}: {e}", self.thread.id());
                    self.thread.throw(e.clone());
                    self.resolver.reject(e);
                    return;
                }
                Step::Suspend(promise) => {
                    let drive = self.clone();
                    promise.then(move |outcome| drive.process(outcome));
                    return;
                }
                Step::Immediate(value) => input = Ok(value),
            }
        }
    }
}

/// Drive `computation` to completion on `thread` (a fresh main thread when
/// none is given). The first step runs before this returns
pub(crate) fn run(
    sched: &Scheduler,
    computation: Box<dyn Computation>,
    thread: Option<&Thread>,
) -> Promise {
    let thread = match thread {
        Some(thread) => thread.clone(),
        None => sched.create_thread(sched.config().main_thread_name()),
    };

    let (promise, resolver) = sched.promise(&thread.name());
    if computation.is_finished() {
        resolver.reject(RuntimeError::NotResumable.into());
        return promise;
    }

    let drive = Rc::new(Drive {
        sched: sched.clone(),
        thread,
        computation: RefCell::new(computation),
        resolver,
    });
    drive.process(Ok(Value::Unit));
    promise
}

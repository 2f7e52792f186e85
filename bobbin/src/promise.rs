//! Single settlement result cell. Continuations are never run inline,
//! settling a [`Promise`] queues them as jobs on the scheduler run queue

use std::{
    cell::{Cell, RefCell},
    fmt::Debug,
    rc::Rc,
};

use crate::{
    Signal, Value,
    runtime::{JobQueue, Priority},
};

pub type Outcome = Result<Value, Signal>;

type Continuation = Box<dyn FnOnce(Outcome)>;

enum State {
    Pending(Vec<Continuation>),
    Settled(Outcome),
}

struct Inner {
    name: String,
    state: RefCell<State>,
    jobs: JobQueue,
    waiting: Cell<bool>,
}

/// Read side of a single settlement cell
#[derive(Clone)]
pub struct Promise {
    inner: Rc<Inner>,
}

/// Write side of a [`Promise`], only the first settlement counts
#[derive(Clone)]
pub struct Resolver {
    inner: Rc<Inner>,
}

impl Debug for Promise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("name", &self.inner.name)
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("name", &self.inner.name)
            .finish()
    }
}

impl Promise {
    pub(crate) fn pending(jobs: &JobQueue, name: &str) -> (Promise, Resolver) {
        let inner = Rc::new(Inner {
            name: name.to_owned(),
            state: RefCell::new(State::Pending(Vec::new())),
            jobs: jobs.clone(),
            waiting: Cell::new(false),
        });
        (
            Promise {
                inner: inner.clone(),
            },
            Resolver { inner },
        )
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Attach a continuation. If the promise has already settled the
    /// continuation is queued straight away with the settled outcome
    pub fn then(&self, f: impl FnOnce(Outcome) + 'static) {
        let mut state = self.inner.state.borrow_mut();
        match &mut *state {
            State::Pending(continuations) => continuations.push(Box::new(f)),
            State::Settled(outcome) => {
                let outcome = outcome.clone();
                self.inner
                    .jobs
                    .push(Box::new(move || f(outcome)), Priority::Continuation);
            }
        }
    }

    /// Derive a new promise settled with `f` applied to this one's outcome
    pub fn map(&self, f: impl FnOnce(Outcome) -> Outcome + 'static) -> Promise {
        let (promise, resolver) = Promise::pending(&self.inner.jobs, &self.inner.name);
        self.then(move |outcome| {
            resolver.resolve(f(outcome));
        });
        promise
    }

    pub fn outcome(&self) -> Option<Outcome> {
        match &*self.inner.state.borrow() {
            State::Pending(_) => None,
            State::Settled(outcome) => Some(outcome.clone()),
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(&*self.inner.state.borrow(), State::Settled(_))
    }

    /// Bridge to host code outside the runtime, the outcome is sent once
    /// the promise settles and the scheduler has been polled
    pub fn receiver(&self) -> flume::Receiver<Outcome> {
        let (tx, rx) = flume::bounded(1);
        self.then(move |outcome| {
            tx.send(outcome)
                .inspect_err(|e| tracing::trace!("promise receiver dropped {e:}"))
                .ok();
        });
        rx
    }

    /// Set on promises handed out by [`crate::Deferred::submit_waiting`],
    /// callers use it to decide whether to block on the result
    pub fn is_waiting(&self) -> bool {
        self.inner.waiting.get()
    }

    pub(crate) fn mark_waiting(&self) {
        self.inner.waiting.set(true);
    }
}

impl Resolver {
    /// Settle the promise. Returns false (and changes nothing) when it has
    /// already been settled
    pub fn resolve(&self, outcome: Outcome) -> bool {
        let mut state = self.inner.state.borrow_mut();
        let continuations = match &mut *state {
            State::Settled(_) => {
                tracing::trace!("dropping second settlement of {}", self.inner.name);
                return false;
            }
            State::Pending(continuations) => std::mem::take(continuations),
        };
        *state = State::Settled(outcome.clone());
        drop(state);

        for continuation in continuations {
            let outcome = outcome.clone();
            self.inner
                .jobs
                .push(Box::new(move || continuation(outcome)), Priority::Continuation);
        }
        true
    }

    pub fn fulfil(&self, value: impl Into<Value>) -> bool {
        self.resolve(Ok(value.into()))
    }

    pub fn reject(&self, error: Signal) -> bool {
        self.resolve(Err(error))
    }

    pub fn promise(&self) -> Promise {
        Promise {
            inner: self.inner.clone(),
        }
    }
}

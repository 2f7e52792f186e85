//! Ordered dispatch of calls against a single handler

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    fmt::Debug,
    rc::Rc,
};

use crate::{Args, Promise, Resolver, Scheduler, Signal, Value};

/// One submitted call, handed to the handler when its turn comes
pub struct DeferredCall {
    args: Args,
    resolver: Resolver,
}

impl DeferredCall {
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn fulfil(&self, value: impl Into<Value>) -> bool {
        self.resolver.fulfil(value)
    }

    pub fn reject(&self, error: Signal) -> bool {
        self.resolver.reject(error)
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }
}

type Handler = Box<dyn Fn(&DeferredCall) -> Option<Promise>>;

struct Inner {
    name: String,
    sched: Scheduler,
    entries: RefCell<VecDeque<DeferredCall>>,
    handler: Handler,
    pending: Cell<bool>,
    in_flight: Cell<bool>,
}

/// Turns submitted calls into strictly ordered handler invocations.
///
/// A new `Deferred` starts out pending: calls queue up until
/// [`Deferred::release`]. A handler either settles the call itself or
/// returns a promise, in which case the next call is only dispatched once
/// that promise settles
#[derive(Clone)]
pub struct Deferred {
    inner: Rc<Inner>,
}

impl Debug for Deferred {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("name", &self.inner.name)
            .field("entries", &self.len())
            .field("pending", &self.is_pending())
            .finish()
    }
}

impl Deferred {
    /// Handler that fulfils each call with its first argument
    pub fn new(sched: &Scheduler, name: &str) -> Self {
        Self::with_handler(sched, name, |call| {
            call.fulfil(call.args().first().cloned().unwrap_or_default());
            None
        })
    }

    pub fn with_handler(
        sched: &Scheduler,
        name: &str,
        handler: impl Fn(&DeferredCall) -> Option<Promise> + 'static,
    ) -> Self {
        Self {
            inner: Rc::new(Inner {
                name: name.to_owned(),
                sched: sched.clone(),
                entries: RefCell::new(VecDeque::new()),
                handler: Box::new(handler),
                pending: Cell::new(true),
                in_flight: Cell::new(false),
            }),
        }
    }

    pub fn submit(&self, args: Args) -> Promise {
        let (promise, resolver) = self.inner.sched.promise(&self.inner.name);
        self.inner
            .entries
            .borrow_mut()
            .push_back(DeferredCall { args, resolver });

        if !self.inner.pending.get() {
            self.drain();
        }
        promise
    }

    /// Like [`Deferred::submit`], with the result flagged for callers that
    /// want to block on it
    pub fn submit_waiting(&self, args: Args) -> Promise {
        let promise = self.submit(args);
        promise.mark_waiting();
        promise
    }

    /// Leave the pending state and dispatch queued calls
    pub fn release(&self) {
        self.inner.pending.set(false);
        self.drain();
    }

    /// Re-enter the pending state; queued calls wait for the next release
    pub fn hold(&self) {
        self.inner.pending.set(true);
    }

    pub fn is_pending(&self) -> bool {
        self.inner.pending.get()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn drain(&self) {
        while !self.inner.pending.get() && self.next() {}
    }

    /// Dispatch the front entry. Returns true if the following entry may be
    /// dispatched right away
    fn next(&self) -> bool {
        if self.inner.in_flight.get() {
            return false;
        }
        let Some(call) = self.inner.entries.borrow_mut().pop_front() else {
            return false;
        };

        match (self.inner.handler)(&call) {
            None => true,
            Some(result) => {
                self.inner.in_flight.set(true);
                let deferred = self.clone();
                result.then(move |outcome| {
                    call.resolver.resolve(outcome);
                    deferred.inner.in_flight.set(false);
                    deferred.drain();
                });
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;
    use crate::args;

    #[test]
    fn queues_until_released() {
        let sched = Scheduler::new();
        let deferred = Deferred::new(&sched, "queue");

        let first = deferred.submit(args![1]);
        let second = deferred.submit_waiting(args![2]);
        assert_eq!(deferred.len(), 2);
        assert!(!first.is_settled());
        assert!(second.is_waiting());
        assert!(!first.is_waiting());

        deferred.release();
        assert!(deferred.is_empty());
        assert_eq!(first.outcome(), Some(Ok(Value::Int(1))));
        assert_eq!(second.outcome(), Some(Ok(Value::Int(2))));

        let third = deferred.submit(args!["now"]);
        assert_eq!(third.outcome(), Some(Ok(Value::from("now"))));

        deferred.hold();
        let fourth = deferred.submit(args![]);
        assert!(!fourth.is_settled());
        assert!(deferred.is_pending());
    }

    #[test]
    fn awaited_results_serialise_dispatch() {
        let sched = Scheduler::new();
        let dispatched = Rc::new(RefCell::new(vec![]));
        let resolvers = Rc::new(RefCell::new(vec![]));

        let seen = dispatched.clone();
        let stash = resolvers.clone();
        let handler_sched = sched.clone();
        let deferred = Deferred::with_handler(&sched, "serial", move |call| {
            seen.borrow_mut().push(call.args()[0].clone());
            let (promise, resolver) = handler_sched.promise("work");
            stash.borrow_mut().push(resolver);
            Some(promise)
        });

        let a = deferred.submit(args!["a"]);
        let b = deferred.submit(args!["b"]);
        deferred.release();

        assert_eq!(*dispatched.borrow(), vec![Value::from("a")]);
        assert_eq!(deferred.len(), 1);

        let first = resolvers.borrow()[0].clone();
        first.fulfil("done a");
        sched.run_until_idle();

        assert_eq!(a.outcome(), Some(Ok(Value::from("done a"))));
        assert_eq!(*dispatched.borrow(), vec![Value::from("a"), Value::from("b")]);
        assert!(!b.is_settled());

        let second = resolvers.borrow()[1].clone();
        second.reject(Signal::failure("no b"));
        sched.run_until_idle();
        assert_eq!(b.outcome(), Some(Err(Signal::failure("no b"))));
    }
}

mod waker;
pub(crate) use waker::{StepHeader, StepWaker};

use std::{
    cell::RefCell,
    fmt::Debug,
    future::Future,
    pin::Pin,
    rc::Rc,
    sync::Arc,
    task::{Context, Poll, Waker},
};

use tracing::instrument;

use crate::{
    Call, Executor, Outcome, Promise, RuntimeError, Scheduler, Signal, Thread, ThreadFn, Value,
    WaitResolver, api::{self, WaitTarget},
};

/// A resumable computation. Each `advance` hands in the outcome of the
/// previous step (`Ok(Value::Unit)` for the first one)
pub trait Computation {
    fn advance(&mut self, input: Outcome) -> Step;

    fn is_finished(&self) -> bool {
        false
    }
}

/// What a computation did with one `advance`
#[derive(Debug)]
pub enum Step {
    Done(Outcome),
    /// Resume once the promise settles
    Suspend(Promise),
    /// Resume straight away with this value
    Immediate(Value),
}

enum Yield {
    Promise(Promise),
    Value(Value),
}

#[derive(Default)]
struct Channel {
    yielded: RefCell<Option<Yield>>,
    resumed: RefCell<Option<Outcome>>,
}

impl Channel {
    fn offer(&self, y: Yield) {
        self.resumed.borrow_mut().take();
        *self.yielded.borrow_mut() = Some(y);
    }
}

/// Drives an `async` body as a [`Computation`]. The body may only suspend
/// through its [`Ctx`]; awaiting anything else that does not complete
/// immediately ends the computation with [`RuntimeError::ForeignAwait`]
pub struct Coroutine {
    future: Pin<Box<dyn Future<Output = Outcome>>>,
    channel: Rc<Channel>,
    header: Arc<StepHeader>,
    waker: Waker,
    done: bool,
}

impl Debug for Coroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coroutine")
            .field("done", &self.done)
            .finish()
    }
}

impl Coroutine {
    pub fn new<B, Fut>(sched: &Scheduler, receiver: Option<Executor>, body: B) -> Self
    where
        B: FnOnce(Ctx) -> Fut,
        Fut: Future<Output = Outcome> + 'static,
    {
        let channel = Rc::new(Channel::default());
        let ctx = Ctx {
            sched: sched.clone(),
            receiver,
            channel: channel.clone(),
        };
        let header = Arc::new(StepHeader::default());

        Self {
            future: Box::pin(body(ctx)),
            channel,
            waker: StepWaker::new_waker(&header),
            header,
            done: false,
        }
    }
}

impl Computation for Coroutine {
    fn advance(&mut self, input: Outcome) -> Step {
        if self.done {
            return Step::Done(Err(RuntimeError::NotResumable.into()));
        }

        *self.channel.resumed.borrow_mut() = Some(input);
        self.header.reset();

        let mut cx = Context::from_waker(&self.waker);
        if let Poll::Ready(outcome) = self.future.as_mut().poll(&mut cx) {
            self.done = true;
            return Step::Done(outcome);
        }

        match self.channel.yielded.borrow_mut().take() {
            Some(Yield::Promise(promise)) => Step::Suspend(promise),
            Some(Yield::Value(value)) => Step::Immediate(value),
            None if self.header.take_woken() => Step::Immediate(Value::Unit),
            None => {
                tracing::error!("Coroutine awaited a future outside of the scheduler");
                self.done = true;
                Step::Done(Err(RuntimeError::ForeignAwait.into()))
            }
        }
    }

    fn is_finished(&self) -> bool {
        self.done
    }
}

/// Handle a coroutine body uses to talk to the scheduler
#[derive(Clone)]
pub struct Ctx {
    sched: Scheduler,
    receiver: Option<Executor>,
    channel: Rc<Channel>,
}

impl Debug for Ctx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ctx")
            .field("receiver", &self.receiver)
            .finish()
    }
}

impl Ctx {
    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    /// Executor this call acts on
    pub fn receiver(&self) -> Option<&Executor> {
        self.receiver.as_ref()
    }

    pub fn current(&self) -> Result<Thread, Signal> {
        self.sched
            .active()
            .ok_or(RuntimeError::NoActiveThread.into())
    }

    async fn yield_to_driver(&self, y: Yield) -> Outcome {
        let channel = self.channel.clone();
        let mut offer = Some(y);
        futures_lite::future::poll_fn(move |_| {
            if let Some(y) = offer.take() {
                channel.offer(y);
                return Poll::Pending;
            }
            match channel.resumed.borrow_mut().take() {
                Some(outcome) => Poll::Ready(outcome),
                None => Poll::Pending,
            }
        })
        .await
    }

    /// Suspend until `promise` settles
    pub async fn suspend(&self, promise: Promise) -> Outcome {
        self.yield_to_driver(Yield::Promise(promise)).await
    }

    /// Hand `value` to the driver, which resumes the body with it straight away
    pub async fn yield_value(&self, value: Value) -> Outcome {
        self.yield_to_driver(Yield::Value(value)).await
    }

    /// Call a thread function. A forked call yields the new thread's id, an
    /// inline one its result
    #[instrument(skip(self, function), fields(function = function.name()))]
    pub async fn call(&self, function: &ThreadFn, args: Vec<Value>) -> Outcome {
        match function.call(args) {
            Call::Forked(thread) => Ok(Value::Thread(thread.id())),
            Call::Inline(promise) => self.suspend(promise).await,
        }
    }

    /// Join a thread, or the last thread queued on an executor
    pub async fn wait_for(&self, target: impl Into<WaitTarget>, blocking: bool) -> Outcome {
        match api::wait_for(&self.sched, target.into(), blocking)? {
            Some(promise) => self.suspend(promise).await,
            None => Ok(Value::Unit),
        }
    }

    /// Wait for the next forked call of `function` to finish
    pub async fn wait_on(&self, function: &ThreadFn, blocking: bool) -> Outcome {
        let promise = api::wait_on(&self.sched, function, blocking)?;
        self.suspend(promise).await
    }

    pub async fn wait(&self, op: impl FnOnce(WaitResolver), blocking: bool) -> Outcome {
        let promise = self.current()?.wait(op, blocking);
        self.suspend(promise).await
    }

    pub async fn block(&self, op: impl FnOnce(WaitResolver)) -> Outcome {
        self.wait(op, true).await
    }

    /// Give up the rest of this turn
    pub async fn pass(&self, blocking: bool) -> Outcome {
        let promise = api::pass(&self.sched, blocking)?;
        self.suspend(promise).await
    }

    /// Take a turn on the receiver: join the last thread queued on it
    pub async fn join_queue(&self) -> Outcome {
        match &self.receiver {
            Some(executor) => self.wait_for(executor.id(), true).await,
            None => Ok(Value::Unit),
        }
    }
}

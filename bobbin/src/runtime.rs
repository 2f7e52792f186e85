use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    fmt::Debug,
    future::Future,
    rc::Rc,
};

use derive_builder::Builder;
use slab::Slab;
use tracing::instrument;

use crate::{
    Args, Computation, Ctx, Executor, ExecutorId, Outcome, Promise, Resolver, RuntimeError, Signal,
    Thread, ThreadFn, ThreadId, Value,
    driver,
    executor::ExecutorState,
    task::Coroutine,
    thread::ThreadState,
};

/// Jobs are drained from the lowest queue index first, so promise
/// continuations always run before the next deferred turn
#[repr(usize)]
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Priority {
    Continuation = 0,
    #[default]
    Turn = 1,
}

pub(crate) type Job = Box<dyn FnOnce()>;

#[derive(Clone, Default)]
pub(crate) struct JobQueue {
    queues: Rc<RefCell<[VecDeque<Job>; 2]>>,
}

impl JobQueue {
    pub(crate) fn push(&self, job: Job, priority: Priority) {
        self.queues.borrow_mut()[priority as usize].push_back(job);
    }

    pub(crate) fn pop(&self) -> Option<Job> {
        self.queues
            .borrow_mut()
            .iter_mut()
            .find_map(|q| q.pop_front())
    }

    pub(crate) fn len(&self) -> usize {
        self.queues.borrow().iter().map(VecDeque::len).sum()
    }

    pub(crate) fn clear(&self) {
        let drained = std::mem::take(&mut *self.queues.borrow_mut());
        drop(drained);
    }
}

/// Construction time settings for a [`Scheduler`]
#[derive(Builder, Clone, Debug)]
#[builder(pattern = "owned", default)]
pub struct SchedulerConfig {
    /// Name given to the thread [`Scheduler::run`] creates when none is passed
    #[builder(setter(into))]
    main_thread_name: String,
    /// Upper bound on jobs executed by one [`Scheduler::run_until_idle`]
    #[builder(setter(strip_option))]
    job_budget: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            main_thread_name: "main".to_owned(),
            job_budget: None,
        }
    }
}

impl SchedulerConfig {
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder::default()
    }

    pub fn with_job_budget(mut self, budget: usize) -> Self {
        self.job_budget = Some(budget);
        self
    }

    pub fn with_main_thread_name(mut self, name: impl Into<String>) -> Self {
        self.main_thread_name = name.into();
        self
    }

    pub fn main_thread_name(&self) -> &str {
        &self.main_thread_name
    }

    pub fn job_budget(&self) -> Option<usize> {
        self.job_budget
    }
}

pub(crate) struct Inner {
    config: SchedulerConfig,
    jobs: JobQueue,
    threads: RefCell<Slab<ThreadState>>,
    executors: RefCell<Slab<ExecutorState>>,
    stack: RefCell<Vec<ThreadId>>,
    waiting: RefCell<Vec<ThreadId>>,
    uids: Cell<u64>,
}

/// Explicit scheduling context. Owns the thread and executor tables, the
/// execution stack, the wait registry and the job queues. Cloning is cheap
/// and every clone refers to the same context.
///
/// Nothing here is `Send`: one scheduler drives one flow of control, and the
/// host application pumps it with [`Scheduler::poll`] or
/// [`Scheduler::run_until_idle`]
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<Inner>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("threads", &self.inner.threads.borrow().len())
            .field("executors", &self.inner.executors.borrow().len())
            .field("jobs", &self.inner.jobs.len())
            .finish()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        tracing::debug!("Creating scheduler with {config:?}");
        Self {
            inner: Rc::new(Inner {
                config,
                jobs: JobQueue::default(),
                threads: RefCell::new(Slab::new()),
                executors: RefCell::new(Slab::new()),
                stack: RefCell::new(Vec::new()),
                waiting: RefCell::new(Vec::new()),
                uids: Cell::new(0),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub(crate) fn next_uid(&self) -> u64 {
        let uid = self.inner.uids.get();
        self.inner.uids.set(uid + 1);
        uid
    }

    pub(crate) fn threads(&self) -> &RefCell<Slab<ThreadState>> {
        &self.inner.threads
    }

    pub(crate) fn executors(&self) -> &RefCell<Slab<ExecutorState>> {
        &self.inner.executors
    }

    pub fn promise(&self, name: &str) -> (Promise, Resolver) {
        Promise::pending(&self.inner.jobs, name)
    }

    pub fn resolved(&self, value: impl Into<Value>) -> Promise {
        let (promise, resolver) = self.promise("resolved");
        resolver.fulfil(value);
        promise
    }

    pub fn rejected(&self, error: Signal) -> Promise {
        let (promise, resolver) = self.promise("rejected");
        resolver.reject(error);
        promise
    }

    /// Queue `job` behind every pending continuation
    pub fn defer(&self, job: impl FnOnce() + 'static) {
        self.inner.jobs.push(Box::new(job), Priority::Turn);
    }

    /// Run a single job, returns false when there was nothing to run
    pub fn poll(&self) -> bool {
        match self.inner.jobs.pop() {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Run jobs until the queues are empty or the configured budget is
    /// spent. Returns the number of jobs executed
    pub fn run_until_idle(&self) -> usize {
        let budget = self.inner.config.job_budget.unwrap_or(usize::MAX);
        let mut ran = 0;
        while ran < budget && self.poll() {
            ran += 1;
        }
        if ran == budget && self.pending_jobs() > 0 {
            tracing::debug!(
                "Job budget of {budget} spent with {} jobs pending",
                self.pending_jobs()
            );
        }
        ran
    }

    pub fn pending_jobs(&self) -> usize {
        self.inner.jobs.len()
    }

    /// Thread on top of the execution stack
    pub fn active(&self) -> Option<Thread> {
        self.current_id().map(|id| Thread::new(self, id))
    }

    pub fn current_id(&self) -> Option<ThreadId> {
        self.inner.stack.borrow().last().copied()
    }

    pub(crate) fn push_active(&self, id: ThreadId) {
        self.inner.stack.borrow_mut().push(id);
    }

    pub(crate) fn pop_active(&self) {
        self.inner.stack.borrow_mut().pop();
    }

    pub(crate) fn register_waiting(&self, id: ThreadId) {
        let mut waiting = self.inner.waiting.borrow_mut();
        if !waiting.contains(&id) {
            waiting.push(id);
        }
    }

    pub(crate) fn unregister_waiting(&self, id: ThreadId) {
        self.inner.waiting.borrow_mut().retain(|w| *w != id);
    }

    /// Threads currently suspended in a wait, in the order they started waiting
    pub fn waiting(&self) -> Vec<ThreadId> {
        self.inner.waiting.borrow().clone()
    }

    pub fn thread(&self, id: ThreadId) -> Result<Thread, RuntimeError> {
        let threads = self.inner.threads.borrow();
        match threads.get(id.key()) {
            Some(state) if state.uid == id.uid() => Ok(Thread::new(self, id)),
            _ => Err(RuntimeError::UnknownThread(id)),
        }
    }

    pub fn thread_count(&self) -> usize {
        self.inner.threads.borrow().len()
    }

    /// Create a detached READY thread, to be handed to [`Scheduler::run`]
    pub fn create_thread(&self, name: &str) -> Thread {
        self.insert_thread(name, None, None)
    }

    pub(crate) fn insert_thread(
        &self,
        name: &str,
        owner: Option<ExecutorId>,
        parent: Option<ThreadId>,
    ) -> Thread {
        let uid = self.next_uid();
        let (completion, resolver) = self.promise(name);
        let key = self.inner.threads.borrow_mut().insert(ThreadState::new(
            uid, name, owner, parent, completion, resolver,
        ));
        let id = ThreadId::new(key, uid);
        tracing::trace!("Created thread {name} {id}");
        Thread::new(self, id)
    }

    pub fn executor(&self, name: &str) -> Executor {
        let uid = self.next_uid();
        let key = self
            .inner
            .executors
            .borrow_mut()
            .insert(ExecutorState::new(uid, name));
        Executor::new(self, ExecutorId::new(key, uid))
    }

    pub fn executor_handle(&self, id: ExecutorId) -> Result<Executor, RuntimeError> {
        let executors = self.inner.executors.borrow();
        match executors.get(id.key()) {
            Some(state) if state.uid == id.uid() => Ok(Executor::new(self, id)),
            _ => Err(RuntimeError::UnknownExecutor(id)),
        }
    }

    /// Wrap an async body into a thread function. Each call builds a fresh
    /// computation from `body` with the call's arguments
    pub fn spawn<F, Fut>(&self, name: &str, body: F) -> ThreadFn
    where
        F: Fn(Ctx, Args) -> Fut + 'static,
        Fut: Future<Output = Outcome> + 'static,
    {
        self.spawn_with(name, move |sched, receiver, args| {
            Box::new(Coroutine::new(sched, receiver, |ctx| body(ctx, args)))
        })
    }

    /// Like [`Scheduler::spawn`] for hand written [`Computation`]s
    pub fn spawn_with<F>(&self, name: &str, factory: F) -> ThreadFn
    where
        F: Fn(&Scheduler, Option<Executor>, Args) -> Box<dyn Computation> + 'static,
    {
        ThreadFn::new(self, name, Box::new(factory))
    }

    /// One-off computation, not tied to any receiver
    pub fn computation<F, Fut>(&self, body: F) -> Box<dyn Computation>
    where
        F: FnOnce(Ctx) -> Fut,
        Fut: Future<Output = Outcome> + 'static,
    {
        Box::new(Coroutine::new(self, None, body))
    }

    /// Drive `computation` to completion on `thread`, or on a fresh thread
    /// named after [`SchedulerConfig::main_thread_name`]
    pub fn run(&self, computation: Box<dyn Computation>, thread: Option<&Thread>) -> Promise {
        driver::run(self, computation, thread)
    }

    /// Drop every thread, executor, job and stack entry. Handles created
    /// before the reset become stale
    #[instrument(skip(self))]
    pub fn reset(&self) {
        let threads = std::mem::take(&mut *self.inner.threads.borrow_mut());
        let executors = std::mem::take(&mut *self.inner.executors.borrow_mut());
        self.inner.stack.borrow_mut().clear();
        self.inner.waiting.borrow_mut().clear();
        self.inner.jobs.clear();

        tracing::debug!(
            "Reset scheduler, dropping {} threads and {} executors",
            threads.len(),
            executors.len()
        );
        drop(threads);
        drop(executors);
    }

    /// Remove terminated threads that no live thread still refers to as its
    /// parent or join target. Returns the number removed
    pub fn reap(&self) -> usize {
        let on_stack = self.inner.stack.borrow().clone();
        let mut threads = self.inner.threads.borrow_mut();

        let referenced = threads
            .iter()
            .filter(|(_, t)| !t.status.is_terminal())
            .flat_map(|(_, t)| [t.parent, t.waiting_for])
            .flatten()
            .chain(on_stack)
            .collect::<Vec<_>>();

        let doomed = threads
            .iter()
            .filter(|(key, t)| {
                t.status.is_terminal() && !referenced.contains(&ThreadId::new(*key, t.uid))
            })
            .map(|(key, _)| key)
            .collect::<Vec<_>>();

        let removed = doomed
            .into_iter()
            .map(|key| threads.remove(key))
            .collect::<Vec<_>>();
        drop(threads);

        tracing::trace!("Reaped {} threads", removed.len());
        removed.len()
    }
}

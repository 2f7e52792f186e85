//! Ownership boundary serialising the threads that act on a shared owner

use std::{
    collections::VecDeque,
    fmt::{Debug, Display},
    future::Future,
};

use tracing::instrument;

use crate::{Args, Ctx, Outcome, Scheduler, Signal, Thread, ThreadFn, ThreadId, driver::Listeners};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ExecutorId {
    key: usize,
    uid: u64,
}

impl ExecutorId {
    pub(crate) fn new(key: usize, uid: u64) -> Self {
        Self { key, uid }
    }

    pub(crate) fn key(&self) -> usize {
        self.key
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }
}

impl Display for ExecutorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.uid)
    }
}

pub(crate) struct ExecutorState {
    pub(crate) uid: u64,
    name: String,
    alive: bool,
    paused: bool,
    locked: Option<ThreadId>,
    queue: VecDeque<ThreadId>,
    paused_members: Vec<ThreadId>,
    listeners: Vec<Listeners>,
}

impl ExecutorState {
    pub(crate) fn new(uid: u64, name: &str) -> Self {
        Self {
            uid,
            name: name.to_owned(),
            alive: true,
            paused: false,
            locked: None,
            queue: VecDeque::new(),
            paused_members: Vec::new(),
            listeners: Vec::new(),
        }
    }
}

/// Handle to an executor. At most one thread holds an executor's lock;
/// threads that block on it queue in FIFO order, except that the lock
/// holder re-enters at the head of the queue
#[derive(Clone)]
pub struct Executor {
    sched: Scheduler,
    id: ExecutorId,
}

impl PartialEq for Executor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("id", &self.id)
            .field("name", &self.name())
            .finish()
    }
}

impl Executor {
    pub(crate) fn new(sched: &Scheduler, id: ExecutorId) -> Self {
        Self {
            sched: sched.clone(),
            id,
        }
    }

    fn with<R>(&self, f: impl FnOnce(&ExecutorState) -> R) -> Option<R> {
        let executors = self.sched.executors().borrow();
        executors
            .get(self.id.key)
            .filter(|state| state.uid == self.id.uid)
            .map(f)
    }

    fn with_mut<R>(&self, f: impl FnOnce(&mut ExecutorState) -> R) -> Option<R> {
        let mut executors = self.sched.executors().borrow_mut();
        executors
            .get_mut(self.id.key)
            .filter(|state| state.uid == self.id.uid)
            .map(f)
    }

    fn thread(&self, id: ThreadId) -> Thread {
        Thread::new(&self.sched, id)
    }

    pub fn id(&self) -> ExecutorId {
        self.id
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    pub fn name(&self) -> String {
        self.with(|s| s.name.clone()).unwrap_or_default()
    }

    pub fn is_alive(&self) -> bool {
        self.with(|s| s.alive).unwrap_or(false)
    }

    pub fn is_paused(&self) -> bool {
        self.with(|s| s.paused).unwrap_or(false)
    }

    /// Thread currently allowed to act on this executor without queueing
    pub fn locked(&self) -> Option<Thread> {
        self.locked_id().map(|id| self.thread(id))
    }

    pub(crate) fn locked_id(&self) -> Option<ThreadId> {
        self.with(|s| s.locked).flatten()
    }

    pub fn queue(&self) -> Vec<ThreadId> {
        self.with(|s| s.queue.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn busy(&self) -> bool {
        self.with(|s| !s.queue.is_empty()).unwrap_or(false)
    }

    /// Spawn a thread function whose calls act on this executor
    pub fn method<F, Fut>(&self, name: &str, body: F) -> ThreadFn
    where
        F: Fn(Ctx, Args) -> Fut + 'static,
        Fut: Future<Output = Outcome> + 'static,
    {
        self.sched.spawn(name, body).bind(self)
    }

    pub(crate) fn register_listeners(&self, listeners: &Listeners) {
        self.with_mut(|s| {
            if !s.listeners.iter().any(|l| l.same(listeners)) {
                s.listeners.push(listeners.clone());
            }
        });
    }

    /// Queue a blocking thread. The lock holder goes to the front and gives
    /// up the lock until it is woken again
    pub(crate) fn enqueue(&self, thread: &Thread) {
        let id = thread.id();
        let pause = self.with_mut(|s| {
            s.queue.retain(|queued| *queued != id);
            if s.locked == Some(id) {
                s.locked = None;
                s.queue.push_front(id);
            } else {
                s.queue.push_back(id);
            }

            if s.paused && !s.paused_members.contains(&id) {
                s.paused_members.push(id);
                true
            } else {
                false
            }
        });

        if pause == Some(true) {
            thread.pause();
        }
    }

    pub(crate) fn remove_queued(&self, id: ThreadId) -> bool {
        self.with_mut(|s| {
            let before = s.queue.len();
            s.queue.retain(|queued| *queued != id);
            before != s.queue.len()
        })
        .unwrap_or(false)
    }

    pub(crate) fn lock(&self, id: ThreadId) {
        self.with_mut(|s| s.locked = Some(id));
    }

    pub(crate) fn release(&self, id: ThreadId) {
        self.with_mut(|s| {
            if s.locked == Some(id) {
                s.locked = None;
            }
        });
    }

    /// Pause every queued thread and remember them for [`Executor::resume`]
    #[instrument(skip(self), fields(executor = %self.id))]
    pub fn pause(&self) {
        let queued = self
            .with_mut(|s| {
                s.paused = true;
                for id in s.queue.iter() {
                    if !s.paused_members.contains(id) {
                        s.paused_members.push(*id);
                    }
                }
                s.queue.iter().copied().collect::<Vec<_>>()
            })
            .unwrap_or_default();

        tracing::debug!("Pausing {} queued threads", queued.len());
        for id in queued {
            self.thread(id).pause();
        }
    }

    #[instrument(skip(self), fields(executor = %self.id))]
    pub fn resume(&self) {
        let members = self
            .with_mut(|s| {
                s.paused = false;
                std::mem::take(&mut s.paused_members)
            })
            .unwrap_or_default();

        tracing::debug!("Resuming {} threads", members.len());
        for id in members {
            self.thread(id).resume();
        }
    }

    /// Interrupt every queued thread
    #[instrument(skip(self), fields(executor = %self.id))]
    pub fn stop(&self) {
        for id in self.queue() {
            self.thread(id).stop();
        }
    }

    /// Mark the executor dead and fail every listener waiting on one of its
    /// thread functions with [`Signal::Expired`]
    #[instrument(skip(self), fields(executor = %self.id))]
    pub fn die(&self) {
        let lists = self
            .with_mut(|s| {
                s.alive = false;
                s.listeners.clone()
            })
            .unwrap_or_default();

        let mut expired = 0;
        for listener in lists.iter().flat_map(Listeners::drain) {
            listener(Err(Signal::Expired));
            expired += 1;
        }
        tracing::debug!("Executor {} died, expiring {expired} listeners", self.name());
    }

    /// One line per queued thread, `thread{i}: <trace>`. Threads already
    /// printed are referred to by their `thread{i}` alias
    pub fn trace_threads(&self, is_async: bool) -> String {
        let mut names: Vec<(String, ThreadId)> = vec![];
        let mut traces = vec![];

        for (i, id) in self.queue().into_iter().enumerate() {
            let alias = format!("thread{i}");
            let trace = self.thread(id).trace(is_async, None, &names);
            traces.push(format!("{alias}: {trace}"));
            names.push((alias, id));
        }
        traces.join("\n")
    }
}

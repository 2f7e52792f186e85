//! Virtual clock actor/handle. Threads park on a [`ClockHandle`] with
//! `wait(ms)`, the host decides when time moves by driving the [`Clock`].
//! Nothing here reads the wall clock, so timed code stays deterministic

use std::collections::BTreeMap;

use bobbin::{Ctx, Outcome, Promise, Resolver, Scheduler, Signal, Value};
use flume::SendError;
use tracing::instrument;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ClockError {
    #[error("Clock has shut down")]
    Closed,
    #[error("ChannelSendError")]
    ChannelSendError,
}

impl<T> From<SendError<T>> for ClockError {
    fn from(_value: SendError<T>) -> Self {
        ClockError::ChannelSendError
    }
}

impl From<ClockError> for Signal {
    fn from(value: ClockError) -> Self {
        Signal::failure(value.to_string())
    }
}

enum ClockMessage {
    Schedule { delay: u64, alarm: Resolver },
}

impl std::fmt::Debug for ClockMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Schedule { delay, alarm } => f
                .debug_struct("Schedule")
                .field("delay", delay)
                .field("alarm", &alarm.promise().name().to_owned())
                .finish(),
        }
    }
}

/// The [`Clock`] actor owns the alarms. It only moves when told to
pub struct Clock {
    sched: Scheduler,
    receiver: flume::Receiver<ClockMessage>,
    now: u64,
    seq: u64,
    alarms: BTreeMap<(u64, u64), Resolver>,
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clock")
            .field("now", &self.now)
            .field("alarms", &self.alarms.len())
            .finish()
    }
}

impl Clock {
    /// Clock at time zero plus the handle threads schedule alarms through
    pub fn initialize(sched: &Scheduler) -> (Clock, ClockHandle) {
        let (tx, rx) = flume::unbounded();
        tracing::trace!("New clock created");
        let clock = Clock {
            sched: sched.clone(),
            receiver: rx,
            now: 0,
            seq: 0,
            alarms: BTreeMap::new(),
        };
        let handle = ClockHandle {
            tx,
            sched: sched.clone(),
        };
        (clock, handle)
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    /// Alarms scheduled and not yet fired
    pub fn pending(&mut self) -> usize {
        self.collect();
        self.alarms.len()
    }

    fn collect(&mut self) {
        while let Ok(message) = self.receiver.try_recv() {
            match message {
                ClockMessage::Schedule { delay, alarm } => {
                    let due = self.now.saturating_add(delay);
                    self.alarms.insert((due, self.seq), alarm);
                    self.seq += 1;
                }
            }
        }
    }

    fn next_due(&self) -> Option<u64> {
        self.alarms.keys().next().map(|(due, _)| *due)
    }

    /// Move time forward by `ms`, firing every alarm that falls due on the
    /// way in (due, registration) order. The scheduler is pumped after each
    /// alarm, so alarms scheduled by woken threads fire in the same call if
    /// they fall inside the window. Returns the number of alarms fired
    #[instrument(skip(self), fields(now = self.now))]
    pub fn advance(&mut self, ms: u64) -> usize {
        let target = self.now.saturating_add(ms);
        let mut fired = 0;

        loop {
            self.sched.run_until_idle();
            self.collect();

            let Some(key) = self.alarms.keys().next().copied() else {
                break;
            };
            if key.0 > target {
                break;
            }
            if let Some(alarm) = self.alarms.remove(&key) {
                self.now = key.0;
                alarm.fulfil(Value::Int(self.now as i64));
                fired += 1;
            }
        }

        self.now = target;
        tracing::debug!("Clock at {target}, fired {fired} alarms");
        fired
    }

    /// Advance alarm by alarm until none remain. Code that keeps scheduling
    /// new alarms keeps this going
    #[instrument(skip(self), fields(now = self.now))]
    pub fn settle(&mut self) -> usize {
        let mut fired = 0;
        loop {
            self.sched.run_until_idle();
            self.collect();
            let Some(due) = self.next_due() else {
                break;
            };
            fired += self.advance(due - self.now);
        }
        fired
    }
}

/// Provides the handle to the [`Clock`] actor
#[derive(Clone)]
pub struct ClockHandle {
    tx: flume::Sender<ClockMessage>,
    sched: Scheduler,
}

impl std::fmt::Debug for ClockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClockHandle").field("tx", &self.tx).finish()
    }
}

impl ClockHandle {
    /// Promise fulfilled with the clock time once `ms` have passed. Rejected
    /// straight away if the clock is gone
    pub fn after(&self, ms: u64) -> Promise {
        let (promise, resolver) = self.sched.promise("after");
        if let Err(SendError(message)) = self.tx.send(ClockMessage::Schedule {
            delay: ms,
            alarm: resolver,
        }) {
            tracing::error!("Send error: {message:?}");
            let ClockMessage::Schedule { alarm, .. } = message;
            alarm.reject(ClockError::Closed.into());
        }
        promise
    }

    /// Park the active thread for `ms`. A blocking wait also holds the
    /// thread's place in its executor queue
    #[instrument(skip(self, ctx))]
    pub async fn wait(&self, ctx: &Ctx, ms: u64, blocking: bool) -> Outcome {
        let alarm = self.after(ms);
        ctx.wait(
            move |resolver| {
                alarm.then(move |outcome| {
                    resolver.settle(outcome);
                })
            },
            blocking,
        )
        .await
    }
}

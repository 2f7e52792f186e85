mod common;

use std::{cell::Cell, rc::Rc};

use bobbin::{
    Computation, Outcome, RuntimeError, Scheduler, SchedulerConfig, Signal, Status, Step, Value,
    args, done,
};
use common::{int, log};

#[test]
fn basic_run() {
    common::init_tracing();
    let sched = Scheduler::new();

    let result = sched.run(
        sched.computation(|ctx| async move {
            let echoed = ctx.yield_value(Value::Int(2)).await?;
            assert_eq!(echoed, Value::Int(2));
            done(3)
        }),
        None,
    );

    // nothing suspended, so the run settles before returning
    assert_eq!(result.outcome(), Some(Ok(Value::Int(3))));
}

#[test]
fn pass_through_promises() {
    let sched = Scheduler::new();

    let result = sched.run(
        sched.computation(|ctx| async move {
            let a = ctx.suspend(ctx.scheduler().resolved(2)).await?;
            let b = ctx.suspend(ctx.scheduler().resolved(3)).await?;
            done(int(&a) + int(&b))
        }),
        None,
    );
    assert!(!result.is_settled());

    sched.run_until_idle();
    assert_eq!(result.outcome(), Some(Ok(Value::Int(5))));
}

#[test]
fn loop_body() {
    let sched = Scheduler::new();

    let result = sched.run(
        sched.computation(|ctx| async move {
            let mut y = 0;
            for x in 0..5i64 {
                y += int(&ctx.suspend(ctx.scheduler().resolved(x)).await?);
            }
            done(y)
        }),
        None,
    );

    sched.run_until_idle();
    assert_eq!(result.outcome(), Some(Ok(Value::Int(10))));
}

#[test]
fn loop_condition() {
    let sched = Scheduler::new();

    let result = sched.run(
        sched.computation(|ctx| async move {
            let (mut x, mut y) = (0, 0i64);
            loop {
                let next = ctx.suspend(ctx.scheduler().resolved(y)).await?;
                y += 1;
                if int(&next) >= 10 {
                    break;
                }
                x += 1;
            }
            done(x)
        }),
        None,
    );

    sched.run_until_idle();
    assert_eq!(result.outcome(), Some(Ok(Value::Int(10))));
}

#[test]
fn caught_rejection_continues_the_body() {
    let sched = Scheduler::new();

    let result = sched.run(
        sched.computation(|ctx| async move {
            let failed = ctx
                .suspend(ctx.scheduler().rejected(Signal::failure("glitch fell over")))
                .await;
            match failed {
                Err(e) => done(e.to_string()),
                Ok(_) => done("not rejected"),
            }
        }),
        None,
    );

    sched.run_until_idle();
    assert_eq!(result.outcome(), Some(Ok(Value::from("glitch fell over"))));
}

#[test]
fn main_thread_takes_the_configured_name() {
    let sched = Scheduler::with_config(SchedulerConfig::default().with_main_thread_name("root"));

    let result = sched.run(
        sched.computation(|ctx| async move { done(ctx.current()?.name()) }),
        None,
    );
    assert_eq!(result.outcome(), Some(Ok(Value::from("root"))));
}

#[test]
fn thread_function_called_inline() {
    let sched = Scheduler::new();
    let add = sched.spawn("add", |ctx, args| async move {
        let a = ctx.suspend(ctx.scheduler().resolved(args[0].clone())).await?;
        let b = ctx.suspend(ctx.scheduler().resolved(args[1].clone())).await?;
        done(int(&a) + int(&b))
    });

    let result = sched.run(
        sched.computation(move |ctx| async move { ctx.call(&add, args![1, 3]).await }),
        None,
    );

    sched.run_until_idle();
    assert_eq!(result.outcome(), Some(Ok(Value::Int(4))));
}

#[test]
fn inline_calls_share_the_thread_stack() {
    let sched = Scheduler::new();
    let stacks = log::<String>();

    let probe = |name: &str| {
        let stacks = stacks.clone();
        sched.spawn(name, move |ctx, _| {
            let stacks = stacks.clone();
            async move {
                stacks.borrow_mut().push(ctx.current()?.trace(false, None, &[]));
                done(8)
            }
        })
    };
    let c = probe("c");
    let d = probe("d");

    let b = {
        let (c, d) = (c.clone(), d.clone());
        sched.spawn("b", move |ctx, _| {
            let (c, d) = (c.clone(), d.clone());
            async move {
                ctx.call(&d, args![]).await?;
                ctx.call(&c, args![]).await
            }
        })
    };
    let a = sched.spawn("a", move |ctx, _| {
        let (b, d) = (b.clone(), d.clone());
        async move {
            ctx.call(&d, args![]).await?;
            ctx.call(&b, args![]).await
        }
    });

    let result = sched.run(
        sched.computation(move |ctx| async move { ctx.call(&a, args![]).await }),
        None,
    );
    sched.run_until_idle();

    assert_eq!(result.outcome(), Some(Ok(Value::Int(8))));
    assert_eq!(
        *stacks.borrow(),
        vec!["a() -> d()", "a() -> b() -> d()", "a() -> b() -> c()"]
    );
}

#[test]
fn uncaught_failure_stops_the_thread() {
    let sched = Scheduler::new();
    let reached = Rc::new(Cell::new(false));
    let failing = sched.spawn("failing", |_ctx, _| async move { bobbin::fail!("Whoops {}", 1) });

    let flag = reached.clone();
    let thread = sched.create_thread("caller");
    let result = sched.run(
        sched.computation(move |ctx| async move {
            let outcome = ctx.call(&failing, args![]).await;
            flag.set(true);
            outcome
        }),
        Some(&thread),
    );

    sched.run_until_idle();
    assert!(!reached.get());
    assert_eq!(result.outcome(), Some(Err(Signal::failure("Whoops 1"))));
    assert_eq!(thread.status(), Status::Stopped);
    assert_eq!(thread.reason(), Some(Signal::failure("Whoops 1")));
}

#[test]
fn awaiting_foreign_futures_is_an_error() {
    let sched = Scheduler::new();
    let thread = sched.create_thread("impatient");

    let result = sched.run(
        sched.computation(|_ctx| async move {
            std::future::pending::<()>().await;
            done(())
        }),
        Some(&thread),
    );

    assert_eq!(
        result.outcome(),
        Some(Err(Signal::Runtime(RuntimeError::ForeignAwait)))
    );
    assert_eq!(thread.status(), Status::Stopped);
}

#[test]
fn paused_thread_defers_its_steps() {
    let sched = Scheduler::new();
    let steps = Rc::new(Cell::new(0));

    let counter = steps.clone();
    let walker = sched.spawn("walker", move |ctx, _| {
        let counter = counter.clone();
        async move {
            for _ in 0..3 {
                ctx.pass(false).await?;
                counter.set(counter.get() + 1);
            }
            done(counter.get())
        }
    });

    let thread = common::forked(walker.call(args![]));
    thread.pause();
    sched.run_until_idle();
    assert_eq!(steps.get(), 0);
    assert_ne!(thread.status(), Status::Finished);

    thread.resume();
    sched.run_until_idle();
    assert_eq!(steps.get(), 3);
    assert_eq!(thread.status(), Status::Finished);
    assert_eq!(thread.completion().outcome(), Some(Ok(Value::Int(3))));
}

struct Countdown {
    sched: Scheduler,
    left: i64,
    seen: i64,
}

impl Computation for Countdown {
    fn advance(&mut self, input: Outcome) -> Step {
        let value = match input {
            Ok(value) => value,
            Err(e) => return Step::Done(Err(e)),
        };
        self.seen += value.as_int().unwrap_or_default();

        if self.left == 0 {
            return Step::Done(Ok(Value::Int(self.seen)));
        }
        self.left -= 1;
        if self.left % 2 == 0 {
            Step::Suspend(self.sched.resolved(self.left))
        } else {
            Step::Immediate(Value::Int(self.left))
        }
    }
}

#[test]
fn hand_written_computations() {
    let sched = Scheduler::new();
    let countdown = sched.spawn_with("countdown", |sched, _, args| {
        Box::new(Countdown {
            sched: sched.clone(),
            left: args[0].as_int().unwrap_or_default(),
            seen: 0,
        })
    });

    let thread = common::forked(countdown.call(args![4]));
    assert_eq!(thread.stack(), vec!["countdown(4)"]);

    sched.run_until_idle();
    assert_eq!(thread.completion().outcome(), Some(Ok(Value::Int(3 + 2 + 1))));
    assert!(thread.stack().is_empty());
}

struct AlreadyDone;

impl Computation for AlreadyDone {
    fn advance(&mut self, _input: Outcome) -> Step {
        Step::Done(Ok(Value::Unit))
    }

    fn is_finished(&self) -> bool {
        true
    }
}

#[test]
fn finished_computations_are_refused() {
    let sched = Scheduler::new();
    let result = sched.run(Box::new(AlreadyDone), None);

    assert_eq!(
        result.outcome(),
        Some(Err(Signal::Runtime(RuntimeError::NotResumable)))
    );
}

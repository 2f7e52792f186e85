mod common;

use std::{cell::Cell, rc::Rc};

use bobbin::{Executor, Scheduler, Signal, Status, ThreadFn, Value, WaitResolver, args, done};
use common::{forked, log, Log};

#[test]
fn error_handlers_see_uncaught_failures() {
    common::init_tracing();
    let sched = Scheduler::new();
    let errors = log::<Signal>();
    let failing = sched.spawn("failing", |_ctx, _| async move { bobbin::fail!("Whoops") });

    let thread = forked(failing.call(args![]));
    let seen = errors.clone();
    thread.error(move |e| seen.borrow_mut().push(e));
    sched.run_until_idle();

    assert_eq!(*errors.borrow(), vec![Signal::failure("Whoops")]);
    assert_eq!(thread.status(), Status::Stopped);
    assert_eq!(thread.reason(), Some(Signal::failure("Whoops")));
}

#[test]
fn throwing_into_a_wait_resumes_the_body() {
    let sched = Scheduler::new();
    let seen = log::<bobbin::Outcome>();

    let poked = {
        let seen = seen.clone();
        sched.spawn("poked", move |ctx, _| {
            let seen = seen.clone();
            async move {
                let first = ctx.block(|_| {}).await;
                seen.borrow_mut().push(first);
                let second = ctx.pass(false).await;
                seen.borrow_mut().push(second);
                done(())
            }
        })
    };

    let thread = forked(poked.call(args![]));
    assert_eq!(thread.status(), Status::Waiting);

    thread.throw(Signal::failure("poke"));
    sched.run_until_idle();

    assert_eq!(
        *seen.borrow(),
        vec![Err(Signal::failure("poke")), Ok(Value::Unit)]
    );
    assert_eq!(thread.status(), Status::Finished);
}

#[test]
fn stopping_itself_ends_the_thread_at_the_next_suspension() {
    let sched = Scheduler::new();
    let reached = Rc::new(Cell::new(false));

    let quitter = {
        let reached = reached.clone();
        sched.spawn("quitter", move |ctx, _| {
            let reached = reached.clone();
            async move {
                ctx.current()?.stop();
                ctx.pass(false).await?;
                reached.set(true);
                done(())
            }
        })
    };

    let thread = forked(quitter.call(args![]));
    sched.run_until_idle();

    assert!(!reached.get());
    assert_eq!(thread.status(), Status::Stopped);
    assert_eq!(thread.reason(), Some(Signal::Interrupted));
    assert_eq!(
        thread.completion().outcome(),
        Some(Err(Signal::Interrupted))
    );
}

#[test]
fn joining_a_stopped_thread_fails_with_its_reason() {
    let sched = Scheduler::new();
    let sleeper = sched.spawn("sleeper", |ctx, _| async move { ctx.block(|_| {}).await });
    let sleeping = forked(sleeper.call(args![]));

    let joiner = {
        let target = sleeping.id();
        sched.spawn("joiner", move |ctx, _| async move {
            match ctx.wait_for(target, false).await {
                Err(e) if e.is_interrupted() => done("interrupted"),
                other => other,
            }
        })
    };
    let joining = forked(joiner.call(args![]));
    assert_eq!(joining.waiting_for(), Some(sleeping.id()));
    assert!(joining.waiting_on(&sleeping));

    sleeping.stop();
    sched.run_until_idle();

    assert_eq!(
        joining.completion().outcome(),
        Some(Ok(Value::from("interrupted")))
    );
    assert_eq!(joining.waiting_for(), None);
    assert!(sched.waiting().is_empty());
}

#[test]
fn cyclic_joins_are_broken() {
    let sched = Scheduler::new();
    let (left, right) = (sched.executor("left"), sched.executor("right"));
    let broken = log::<Value>();

    let back = {
        let broken = broken.clone();
        right.method("back", move |ctx, args| {
            let broken = broken.clone();
            async move {
                let caller = args[0]
                    .as_thread()
                    .ok_or(Signal::failure("expected a thread id"))?;
                let joined = ctx.wait_for(caller, false).await?;
                broken.borrow_mut().push(joined);
                done("back")
            }
        })
    };

    let forth = left.method("forth", move |ctx, _| {
        let back = back.clone();
        async move {
            let me = ctx.current()?.id();
            let spawned = ctx.call(&back, args![me]).await?;
            let other = spawned
                .as_thread()
                .ok_or(Signal::failure("expected a forked call"))?;
            ctx.wait_for(other, false).await
        }
    });

    let thread = forked(forth.call(args![]));
    sched.run_until_idle();

    assert_eq!(*broken.borrow(), vec![Value::CycleBroken]);
    assert_eq!(thread.completion().outcome(), Some(Ok(Value::from("back"))));
    assert_eq!(thread.status(), Status::Finished);
    assert!(sched.waiting().is_empty());
}

#[test]
fn waiting_for_yourself_is_a_cycle() {
    let sched = Scheduler::new();
    let narcissus = sched.spawn("narcissus", |ctx, _| async move {
        let me = ctx.current()?;
        ctx.wait_for(&me, false).await
    });

    let thread = forked(narcissus.call(args![]));
    sched.run_until_idle();

    assert_eq!(thread.completion().outcome(), Some(Ok(Value::CycleBroken)));
    assert_eq!(thread.status(), Status::Finished);
}

/// `otherFunction` calls `blockingFunction` on the same executor, both
/// record the trace of the thread they run on
fn traced(exec: &Executor, traces: &Log<String>) -> ThreadFn {
    let record = |traces: &Log<String>, ctx: &bobbin::Ctx| -> Result<(), Signal> {
        traces
            .borrow_mut()
            .push(ctx.current()?.trace(false, None, &[]));
        Ok(())
    };

    let blocking = {
        let traces = traces.clone();
        exec.method("blockingFunction", move |ctx, args| {
            let traces = traces.clone();
            async move {
                record(&traces, &ctx)?;
                ctx.pass(true).await?;
                done(args[0].clone())
            }
        })
    };

    let traces = traces.clone();
    exec.method("otherFunction", move |ctx, args| {
        let (traces, blocking) = (traces.clone(), blocking.clone());
        async move {
            record(&traces, &ctx)?;
            ctx.call(&blocking, args).await
        }
    })
}

#[test]
fn traces_follow_inline_and_forked_calls() {
    let sched = Scheduler::new();
    let (greg, tim) = (sched.executor("greg"), sched.executor("tim"));
    let traces = log::<String>();
    let greg_other = traced(&greg, &traces);
    let tim_other = traced(&tim, &traces);

    let main = {
        let traces = traces.clone();
        greg.method("main", move |ctx, _| {
            let (greg_other, tim_other, traces) =
                (greg_other.clone(), tim_other.clone(), traces.clone());
            async move {
                let record = |ctx: &bobbin::Ctx| -> Result<(), Signal> {
                    traces
                        .borrow_mut()
                        .push(ctx.current()?.trace(false, None, &[]));
                    Ok(())
                };

                ctx.call(&greg_other, args![10]).await?;
                record(&ctx)?;
                let spawned = ctx.call(&tim_other, args![10]).await?;
                record(&ctx)?;
                if let Some(id) = spawned.as_thread() {
                    ctx.wait_for(id, false).await?;
                }
                record(&ctx)?;
                done(())
            }
        })
    };

    let thread = forked(main.call(args![]));
    sched.run_until_idle();

    assert_eq!(thread.status(), Status::Finished);
    assert_eq!(
        *traces.borrow(),
        vec![
            "greg: main() -> otherFunction(10)",
            "greg: main() -> otherFunction(10) -> blockingFunction(10)",
            "greg: main()",
            "greg: main() ==> tim: otherFunction(10)",
            "greg: main() ==> tim: otherFunction(10) -> blockingFunction(10)",
            "greg: main()",
            "greg: main()",
        ]
    );
    assert!(thread.stack().is_empty());
}

#[test]
fn reaping_keeps_parents_of_live_threads() {
    let sched = Scheduler::new();
    let exec = sched.executor("exec");
    let stash = log::<WaitResolver>();

    let child = {
        let stash = stash.clone();
        exec.method("child", move |ctx, _| {
            let stash = stash.clone();
            async move {
                ctx.block(move |resolver| stash.borrow_mut().push(resolver))
                    .await
            }
        })
    };
    let parent = sched.spawn("parent", move |ctx, _| {
        let child = child.clone();
        async move { ctx.call(&child, args![]).await }
    });

    let thread = forked(parent.call(args![]));
    sched.run_until_idle();
    assert_eq!(thread.status(), Status::Finished);
    assert_eq!(sched.thread_count(), 2);

    assert_eq!(sched.reap(), 0);
    assert!(sched.thread(thread.id()).is_ok());

    let blocked = sched.thread(exec.queue()[0]).expect("child is queued");
    assert_eq!(blocked.parent(), Some(thread.id()));
    blocked.stop();
    sched.run_until_idle();

    assert_eq!(sched.reap(), 2);
    assert_eq!(sched.thread_count(), 0);
    assert!(sched.thread(thread.id()).is_err());
    // handles to reaped threads read as stopped
    assert_eq!(thread.status(), Status::Stopped);
}

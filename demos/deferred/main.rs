//! Ordered dispatch through a `Deferred`: requests queue up while the
//! mailbox is held, then run strictly one after another even though each
//! one finishes on a later scheduler turn

use std::{cell::RefCell, rc::Rc};

use tracing_subscriber::{EnvFilter, FmtSubscriber};

use bobbin::{Deferred, Scheduler, Value, args};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let sched = Scheduler::new();
    let log = Rc::new(RefCell::new(Vec::new()));

    let mailbox = {
        let (turns, log) = (sched.clone(), log.clone());
        Deferred::with_handler(&sched, "mailbox", move |call| {
            let letter = call.args().first().cloned().unwrap_or_default();
            log.borrow_mut().push(format!("opened {letter}"));

            let (reply, resolver) = turns.promise("reply");
            let log = log.clone();
            turns.defer(move || {
                log.borrow_mut().push(format!("answered {letter}"));
                resolver.fulfil(Value::from(format!("re: {letter}")));
            });
            Some(reply)
        })
    };

    let replies = ["bills", "postcard", "parcel"]
        .into_iter()
        .map(|letter| mailbox.submit(args![letter]))
        .collect::<Vec<_>>();
    println!("{} letters waiting", mailbox.len());

    mailbox.release();
    sched.run_until_idle();

    for line in log.borrow().iter() {
        println!("{line}");
    }
    for reply in replies {
        println!("{}", reply.outcome().unwrap_or(Ok(Value::Unit))?);
    }
    Ok(())
}

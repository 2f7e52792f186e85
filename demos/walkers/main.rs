//! Walkers taking turns on a narrow bridge. Each walker joins the bridge
//! queue, spends some virtual time crossing, and hands the bridge on.
//! Run with `RUST_LOG=bobbin=trace` to watch the scheduler at work

use tracing_subscriber::{EnvFilter, FmtSubscriber};

use bobbin::{Scheduler, SchedulerConfig, Value, args, done};
use bobbin_utils::Clock;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let config = SchedulerConfig::builder()
        .main_thread_name("town")
        .job_budget(10_000)
        .build()?;
    let sched = Scheduler::with_config(config);
    let (mut clock, handle) = Clock::initialize(&sched);
    let bridge = sched.executor("bridge");

    let cross = {
        let handle = handle.clone();
        bridge.method("cross", move |ctx, args| {
            let handle = handle.clone();
            async move {
                ctx.join_queue().await?;
                let pace = args[1].as_int().unwrap_or(1);
                let arrived = handle.wait(&ctx, pace as u64 * 10, true).await?;
                tracing::info!("{} crossed at t={arrived}", args[0]);
                done(arrived)
            }
        })
    };

    let walk = {
        let bridge = bridge.clone();
        sched.spawn("walk", move |ctx, _| {
            let (cross, bridge) = (cross.clone(), bridge.clone());
            async move {
                for (name, pace) in [("ann", 3), ("bob", 1), ("cat", 2)] {
                    ctx.call(&cross, args![name, pace]).await?;
                }
                println!("{}", bridge.trace_threads(true));
                ctx.wait_for(&bridge, false).await
            }
        })
    };

    let finished = walk.call(args![]).into_promise().receiver();
    let fired = clock.settle();

    match finished.try_recv()? {
        Ok(Value::Int(last)) => println!("everyone crossed by t={last} ({fired} alarms)"),
        Ok(other) => println!("walk ended with {other}"),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

#![allow(dead_code)]

use std::{cell::RefCell, rc::Rc};

use bobbin::{Call, Thread, Value};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Opt-in log output, `RUST_LOG=bobbin=trace cargo test`
pub fn init_tracing() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}

pub type Log<T> = Rc<RefCell<Vec<T>>>;

pub fn log<T>() -> Log<T> {
    Rc::new(RefCell::new(Vec::new()))
}

pub fn int(value: &Value) -> i64 {
    value.as_int().expect("integer value")
}

pub fn forked(call: Call) -> Thread {
    call.thread().cloned().expect("call forked a thread")
}

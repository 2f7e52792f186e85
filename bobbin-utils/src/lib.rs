//! Helper library to provide utilities to be used with the
//! bobbin runtime
//!
//! Currently provides a virtual clock actor/handle for timed waits

pub mod timer;

pub use timer::{Clock, ClockError, ClockHandle};

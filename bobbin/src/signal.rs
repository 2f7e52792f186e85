//! Failure signals carried by rejected promises and stopped threads

use crate::{ExecutorId, ThreadId};

/// Everything that can end a wait or a thread early. A stop is just
/// another signal, so it travels through the same path as real errors
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Signal {
    #[error("InterruptedException")]
    Interrupted,
    #[error("ExpiredExecutorException")]
    Expired,
    #[error("{0}")]
    Failure(String),
    #[error("Runtime error {0}")]
    Runtime(#[from] RuntimeError),
}

impl Signal {
    pub fn failure(message: impl Into<String>) -> Self {
        Signal::Failure(message.into())
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Signal::Interrupted)
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, Signal::Expired)
    }
}

/// Misuse of the scheduler api, surfaced as [`Signal::Runtime`]
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("no thread is active")]
    NoActiveThread,
    #[error("unknown thread {0}")]
    UnknownThread(ThreadId),
    #[error("unknown executor {0}")]
    UnknownExecutor(ExecutorId),
    #[error("thread {0} has already terminated")]
    Terminated(ThreadId),
    #[error("computation cannot be resumed")]
    NotResumable,
    #[error("computation awaited a future the scheduler does not drive")]
    ForeignAwait,
}

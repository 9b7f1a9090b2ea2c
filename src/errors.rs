//! Caller-facing errors.

use thiserror::Error;

use crate::messages::RemoteError;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PoolError {
    /// Admission control refused the call; the value is the ongoing count.
    #[error("Too many concurrent calls ({0})")]
    MaxConcurrentCalls(usize),
    #[error("worker call timed out!")]
    Timeout,
    /// The call kept crashing its workers and ran out of retries.
    #[error("cancel after {retries} retries!")]
    ProcessTerminated { retries: u32 },
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("worker pool is shutting down")]
    ShuttingDown,
    #[error("worker pool is no longer running")]
    Closed,
    #[error("invalid worker pool configuration: {0}")]
    Config(String),
    #[error("failed to spawn worker: {0}")]
    Spawn(String),
    #[error("failed to decode call result: {0}")]
    Decode(String),
}

impl PoolError {
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(err) => Some(err),
            _ => None,
        }
    }
}

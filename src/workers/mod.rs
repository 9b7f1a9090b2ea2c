//! Pool-side worker management.

mod process;
mod status;
mod worker;

pub(crate) use process::WorkerProcess;
pub use status::{PoolStatsSnapshot, WorkerHandle, WorkerInfo};
pub(crate) use worker::Worker;

use crate::messages::Response;

/// Notifications a worker sends to its pool.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Ready {
        worker_id: u64,
    },
    Response {
        worker_id: u64,
        response: Response,
    },
    /// The worker is gone. `code` is `None` when it was killed by a signal or
    /// abandoned after ignoring an exit request.
    Exit {
        worker_id: u64,
        code: Option<i32>,
    },
    CallTimedOut {
        worker_id: u64,
        call_id: u64,
    },
}

//! worker-nodes - a dynamic pool of worker processes or threads that run
//! calls against one module.

pub mod bridge;
mod config;
pub mod errors;
pub mod messages;
pub mod observability;
pub mod options;
pub mod pool;
pub mod queue;
pub mod runtime;
pub mod sequence;
mod task;
pub mod transport;
pub mod workers;

pub use errors::PoolError;
pub use messages::{ErrorKind, ErrorRecord, MessageError, RemoteError};
pub use options::{PoolOptions, ResourceLimits, WorkerType};
pub use pool::WorkerPool;
pub use rmpv::Value;
pub use runtime::{Diagnostic, Module, ModuleRegistry, WorkerArgs, run_process_worker};
pub use workers::{PoolStatsSnapshot, WorkerHandle, WorkerInfo};

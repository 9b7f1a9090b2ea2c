//! Point-in-time views of a pool and its workers.

use chrono::{DateTime, Utc};

use crate::options::ResourceLimits;

/// The OS-level handle behind a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerHandle {
    Process {
        pid: Option<u32>,
    },
    Thread {
        name: String,
        resource_limits: Option<ResourceLimits>,
    },
}

#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub id: u64,
    pub tasks_started: usize,
    pub active_calls: usize,
    pub is_operational: bool,
    pub is_terminating: bool,
    pub is_process_alive: bool,
    /// Set when the worker reported ready.
    pub start_date: Option<DateTime<Utc>>,
    pub handle: WorkerHandle,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    pub total_workers: usize,
    pub operational_workers: usize,
    pub busy_workers: usize,
    pub pending_tasks: usize,
    pub ongoing_tasks: usize,
    pub is_ready: bool,
    pub termination_started: bool,
    pub terminated: bool,
}

//! Pool-side view of one worker: its in-flight calls and lifecycle flags.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use super::{WorkerEvent, WorkerHandle, WorkerInfo, WorkerProcess};
use crate::{
    bridge::WorkerBridgeServer,
    errors::PoolError,
    messages::WorkerCommand,
    options::WorkerOptions,
    sequence::WORKER_SERIAL,
    task::Task,
};

/// Capacity rules shared by every worker of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WorkerLimits {
    pub(crate) max_tasks: usize,
    pub(crate) endurance: Option<usize>,
}

/// Counters and flags that decide whether a worker takes more work.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct WorkerState {
    pub(crate) active_calls: usize,
    pub(crate) tasks_started: usize,
    pub(crate) is_terminating: bool,
    pub(crate) is_process_alive: bool,
}

impl WorkerState {
    pub(crate) fn is_busy(&self) -> bool {
        self.active_calls > 0
    }

    pub(crate) fn is_exhausted(&self, limits: WorkerLimits) -> bool {
        limits
            .endurance
            .is_some_and(|endurance| self.tasks_started >= endurance)
    }

    pub(crate) fn can_accept_work(&self, limits: WorkerLimits) -> bool {
        !self.is_terminating
            && self.active_calls < limits.max_tasks
            && !self.is_exhausted(limits)
    }

    pub(crate) fn is_operational(&self) -> bool {
        self.is_process_alive && !self.is_terminating
    }
}

pub(crate) struct Worker {
    id: u64,
    process: WorkerProcess,
    calls: HashMap<u64, Task>,
    limits: WorkerLimits,
    state: WorkerState,
}

impl Worker {
    pub(crate) fn spawn(
        options: &WorkerOptions,
        bridge: Option<&Arc<WorkerBridgeServer>>,
        events: UnboundedSender<WorkerEvent>,
    ) -> Result<Self, PoolError> {
        let id = WORKER_SERIAL.next_value();
        let process = WorkerProcess::spawn(id, options, bridge, events)?;
        Ok(Self {
            id,
            process,
            calls: HashMap::new(),
            limits: WorkerLimits {
                max_tasks: options.max_tasks,
                endurance: options.endurance,
            },
            state: WorkerState::default(),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Send a call to the worker and track it until it settles.
    pub(crate) fn handle(&mut self, task: Task) {
        let request = task.request(self.id);
        self.state.tasks_started += 1;
        if !self.process.send(WorkerCommand::Call(request)) {
            warn!(
                worker_id = self.id,
                call_id = task.id,
                "worker channel closed, call will settle when the worker exit is observed"
            );
        }
        self.calls.insert(task.id, task);
        self.state.active_calls = self.calls.len();
    }

    /// Stop tracking one call and hand it back.
    pub(crate) fn take_call(&mut self, call_id: u64) -> Option<Task> {
        let task = self.calls.remove(&call_id);
        self.state.active_calls = self.calls.len();
        task
    }

    pub(crate) fn has_call(&self, call_id: u64) -> bool {
        self.calls.contains_key(&call_id)
    }

    /// Take every in-flight call, oldest first.
    pub(crate) fn withdraw_tasks(&mut self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.calls.drain().map(|(_, task)| task).collect();
        tasks.sort_by_key(|task| task.id);
        self.state.active_calls = 0;
        tasks
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.state.is_busy()
    }

    pub(crate) fn is_terminating(&self) -> bool {
        self.state.is_terminating
    }

    pub(crate) fn is_process_alive(&self) -> bool {
        self.state.is_process_alive
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.state.is_exhausted(self.limits)
    }

    pub(crate) fn can_accept_work(&self) -> bool {
        self.state.can_accept_work(self.limits)
    }

    pub(crate) fn is_operational(&self) -> bool {
        self.state.is_operational()
    }

    pub(crate) fn mark_ready(&mut self) {
        self.state.is_process_alive = true;
        self.process.mark_ready();
    }

    pub(crate) fn mark_exited(&mut self) {
        self.state.is_process_alive = false;
        self.state.is_terminating = true;
    }

    /// Begin a graceful stop. Idempotent.
    pub(crate) fn stop(&mut self) {
        if self.state.is_terminating {
            return;
        }
        debug!(worker_id = self.id, "stopping worker");
        self.state.is_terminating = true;
        self.process.exit();
    }

    pub(crate) fn profiler(&self, duration: Duration) {
        let duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.process.send(WorkerCommand::Profiler { duration_ms });
    }

    pub(crate) fn take_snapshot(&self) {
        self.process.send(WorkerCommand::TakeSnapshot);
    }

    pub(crate) fn handle_info(&self) -> WorkerHandle {
        self.process.handle().clone()
    }

    pub(crate) fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.id,
            tasks_started: self.state.tasks_started,
            active_calls: self.state.active_calls,
            is_operational: self.is_operational(),
            is_terminating: self.state.is_terminating,
            is_process_alive: self.state.is_process_alive,
            start_date: self.process.start_date(),
            handle: self.handle_info(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: WorkerLimits = WorkerLimits {
        max_tasks: 2,
        endurance: Some(3),
    };

    #[test]
    fn accepts_work_until_saturated() {
        let mut state = WorkerState::default();
        assert!(state.can_accept_work(LIMITS));
        state.active_calls = 2;
        state.tasks_started = 2;
        assert!(!state.can_accept_work(LIMITS));
        assert!(state.is_busy());
    }

    #[test]
    fn exhausted_workers_refuse_work() {
        let state = WorkerState {
            tasks_started: 3,
            ..WorkerState::default()
        };
        assert!(state.is_exhausted(LIMITS));
        assert!(!state.can_accept_work(LIMITS));

        let unlimited = WorkerLimits {
            max_tasks: 2,
            endurance: None,
        };
        assert!(!state.is_exhausted(unlimited));
    }

    #[test]
    fn terminating_workers_refuse_work_and_are_not_operational() {
        let state = WorkerState {
            is_process_alive: true,
            is_terminating: true,
            ..WorkerState::default()
        };
        assert!(!state.can_accept_work(LIMITS));
        assert!(!state.is_operational());
    }

    #[test]
    fn operational_requires_a_live_process() {
        let mut state = WorkerState::default();
        assert!(!state.is_operational());
        state.is_process_alive = true;
        assert!(state.is_operational());
    }
}

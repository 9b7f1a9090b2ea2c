//! The worker pool.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  PoolCommand   ┌───────────────────────────────────────┐
//! │  WorkerPool  │ ─────────────▶ │              PoolCore                 │
//! │ (cloneable)  │ ◀── oneshot ── │  pending ─▶ pick_worker ─▶ Worker     │
//! └──────────────┘                │  ongoing (admission)     ─▶ Worker    │
//!                                 └───────────────▲───────────────────────┘
//!                                                 │ WorkerEvent
//!                                 ready / response / exit / call timeout
//! ```
//!
//! `PoolCore` runs as a single task and handles one command or worker event
//! to completion before looking at the next, so every queue and worker is
//! only ever touched from one place.
//!
//! ## Call lifecycle
//!
//! 1. A call is admitted unless `max_tasks` calls are already in flight
//! 2. The task waits in the pending queue until a worker can take it
//! 3. While dispatched it is tracked by its worker and counted as ongoing
//! 4. A response settles it; a timeout rejects it and stops the worker; a
//!    crash puts it back in the pending queue until it runs out of retries

use std::{sync::Arc, time::Duration};

use rmpv::Value;
use serde::de::DeserializeOwned;
use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    oneshot,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    bridge::WorkerBridgeServer,
    errors::PoolError,
    messages::{MODULE_EXPORT, Response},
    options::{PoolOptions, WorkerOptions, WorkerType},
    queue::Queue,
    task::{Task, TaskReply},
    workers::{PoolStatsSnapshot, Worker, WorkerEvent, WorkerHandle, WorkerInfo},
};

/// Consecutive workers that may die before ever becoming ready before the
/// pool stops respawning on its own.
const MAX_STARTUP_FAILURES: u32 = 3;

enum PoolCommand {
    Call {
        method: String,
        args: Vec<Value>,
        reply: TaskReply,
    },
    Ready {
        reply: oneshot::Sender<()>,
    },
    Terminate {
        reply: oneshot::Sender<()>,
    },
    Workers {
        reply: oneshot::Sender<Vec<WorkerInfo>>,
    },
    Stats {
        reply: oneshot::Sender<PoolStatsSnapshot>,
    },
    Profiler {
        duration: Duration,
    },
    TakeSnapshot,
}

/// Handle to a pool of workers serving one module.
///
/// Cloning is cheap; every clone talks to the same pool. Once the last
/// handle is dropped the pool stops its workers.
///
/// # Example
///
/// ```ignore
/// let pool = WorkerPool::new("fixture", PoolOptions::process("/usr/local/bin/fixture-worker"))?;
/// let sum = pool.call("add", vec![Value::from(1), Value::from(2)]).await?;
/// pool.terminate().await?;
/// ```
#[derive(Clone)]
pub struct WorkerPool {
    commands: UnboundedSender<PoolCommand>,
    module_path: Arc<str>,
}

impl WorkerPool {
    /// Validate `options` and start the pool.
    ///
    /// Must be called from within a tokio runtime. With `auto_start` the
    /// initial workers are spawned before this returns.
    pub fn new(module_path: impl Into<String>, options: PoolOptions) -> Result<Self, PoolError> {
        let module_path = module_path.into();
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(PoolError::Config(
                "worker pools must be created inside a tokio runtime".into(),
            ));
        }
        let worker_options = options.worker_options(&module_path)?;

        let bridge = match worker_options.worker_type {
            WorkerType::Process => Some(
                WorkerBridgeServer::bind(None, worker_options.max_message_size)
                    .map_err(|err| PoolError::Spawn(format!("{err:#}")))?,
            ),
            WorkerType::Thread => None,
        };

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        info!(
            module_path = %module_path,
            worker_type = %worker_options.worker_type,
            min_workers = options.min_workers,
            max_workers = options.max_workers,
            max_tasks = ?options.max_tasks,
            lazy_start = options.lazy_start,
            "starting worker pool"
        );

        let mut core = PoolCore::new(options, worker_options, bridge, events_tx);
        core.start()?;
        tokio::spawn(core.run(commands_rx, events_rx));

        Ok(Self {
            commands: commands_tx,
            module_path: module_path.into(),
        })
    }

    pub fn module_path(&self) -> &str {
        &self.module_path
    }

    /// Call a named method of the module on some worker.
    pub async fn call(
        &self,
        method: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<Value, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.send(PoolCommand::Call {
            method: method.into(),
            args,
            reply,
        })?;
        rx.await.map_err(|_| PoolError::Closed)?
    }

    /// Call the module itself, for modules registered with a callable export.
    pub async fn call_module(&self, args: Vec<Value>) -> Result<Value, PoolError> {
        self.call(MODULE_EXPORT, args).await
    }

    /// Call a method and decode its result into `R`.
    pub async fn call_as<R: DeserializeOwned>(
        &self,
        method: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<R, PoolError> {
        let value = self.call(method, args).await?;
        rmpv::ext::from_value(value).map_err(|err| PoolError::Decode(err.to_string()))
    }

    /// Resolve once at least `min_workers` workers are operational.
    pub async fn ready(&self) -> Result<Self, PoolError> {
        self.query(|reply| PoolCommand::Ready { reply }).await?;
        Ok(self.clone())
    }

    /// Stop accepting calls, let in-flight calls finish, and stop every
    /// worker. Resolves after the last worker exited.
    pub async fn terminate(&self) -> Result<(), PoolError> {
        self.query(|reply| PoolCommand::Terminate { reply }).await
    }

    pub async fn workers(&self) -> Result<Vec<WorkerInfo>, PoolError> {
        self.query(|reply| PoolCommand::Workers { reply }).await
    }

    /// OS-level handles of the current workers.
    pub async fn used_workers(&self) -> Result<Vec<WorkerHandle>, PoolError> {
        let workers = self.workers().await?;
        Ok(workers.into_iter().map(|worker| worker.handle).collect())
    }

    pub async fn stats(&self) -> Result<PoolStatsSnapshot, PoolError> {
        self.query(|reply| PoolCommand::Stats { reply }).await
    }

    /// Ask one worker to profile itself for `duration`.
    pub fn profiler(&self, duration: Duration) -> Result<(), PoolError> {
        self.send(PoolCommand::Profiler { duration })
    }

    /// Ask one worker to take a heap snapshot.
    pub fn take_snapshot(&self) -> Result<(), PoolError> {
        self.send(PoolCommand::TakeSnapshot)
    }

    fn send(&self, command: PoolCommand) -> Result<(), PoolError> {
        self.commands.send(command).map_err(|_| PoolError::Closed)
    }

    async fn query<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> PoolCommand,
    ) -> Result<T, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply))?;
        rx.await.map_err(|_| PoolError::Closed)
    }
}

struct PoolCore {
    options: PoolOptions,
    worker_options: WorkerOptions,
    bridge: Option<Arc<WorkerBridgeServer>>,
    events: UnboundedSender<WorkerEvent>,
    workers: Queue<Worker>,
    pending: Queue<Task>,
    ongoing: Queue<u64>,
    is_ready: bool,
    ready_waiters: Vec<oneshot::Sender<()>>,
    termination_started: bool,
    terminated: bool,
    termination_waiters: Vec<oneshot::Sender<()>>,
    startup_failures: u32,
}

impl PoolCore {
    fn new(
        options: PoolOptions,
        worker_options: WorkerOptions,
        bridge: Option<Arc<WorkerBridgeServer>>,
        events: UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            workers: Queue::bounded(Some(options.max_workers)),
            pending: Queue::new(),
            ongoing: Queue::bounded(options.max_tasks),
            options,
            worker_options,
            bridge,
            events,
            is_ready: false,
            ready_waiters: Vec::new(),
            termination_started: false,
            terminated: false,
            termination_waiters: Vec::new(),
            startup_failures: 0,
        }
    }

    fn start(&mut self) -> Result<(), PoolError> {
        if self.options.auto_start {
            if self.options.lazy_start {
                for _ in 0..self.options.min_workers {
                    self.start_worker()?;
                }
            } else {
                while self.can_start_worker() {
                    self.start_worker()?;
                }
            }
        }
        self.check_readiness();
        Ok(())
    }

    async fn run(
        mut self,
        mut commands: UnboundedReceiver<PoolCommand>,
        mut events: UnboundedReceiver<WorkerEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
        }
        self.shutdown_now();
    }

    fn handle_command(&mut self, command: PoolCommand) {
        match command {
            PoolCommand::Call {
                method,
                args,
                reply,
            } => self.submit(method, args, reply),
            PoolCommand::Ready { reply } => {
                if self.is_ready {
                    let _ = reply.send(());
                } else {
                    self.ready_waiters.push(reply);
                }
            }
            PoolCommand::Terminate { reply } => self.terminate(reply),
            PoolCommand::Workers { reply } => {
                let _ = reply.send(self.workers.iter().map(Worker::info).collect());
            }
            PoolCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            PoolCommand::Profiler { duration } => {
                if let Some(worker) = self.pick_worker_ref() {
                    worker.profiler(duration);
                }
            }
            PoolCommand::TakeSnapshot => {
                if let Some(worker) = self.pick_worker_ref() {
                    worker.take_snapshot();
                }
            }
        }
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Ready { worker_id } => self.on_worker_ready(worker_id),
            WorkerEvent::Response {
                worker_id,
                response,
            } => self.on_response(worker_id, response),
            WorkerEvent::Exit { worker_id, code } => self.on_worker_exit(worker_id, code),
            WorkerEvent::CallTimedOut { worker_id, call_id } => {
                self.on_call_timeout(worker_id, call_id)
            }
        }
    }

    fn submit(&mut self, method: String, args: Vec<Value>, reply: TaskReply) {
        if self.termination_started {
            let _ = reply.send(Err(PoolError::ShuttingDown));
            return;
        }
        if self.ongoing.is_full() {
            let ongoing = self.ongoing.len();
            debug!(ongoing, method = %method, "rejecting call, too many concurrent calls");
            let _ = reply.send(Err(PoolError::MaxConcurrentCalls(ongoing)));
            return;
        }

        let task = Task::new(method, args, reply);
        trace!(call_id = task.id, method = %task.method, "call queued");
        self.pending.enqueue(task);
        self.process_queue();
    }

    fn process_queue(&mut self) {
        while !self.pending.is_empty() && !self.ongoing.is_full() {
            let Some(worker_id) = self.pick_worker() else {
                break;
            };
            self.dispatch_next(worker_id);
        }
        self.check_shutdown();
    }

    /// Choose a worker for the next call and move it to the back of the
    /// queue.
    ///
    /// Lazy pools take any worker with spare capacity, even one still
    /// starting, and only grow when none has room. Eager pools only take
    /// workers that reported ready and start another worker whenever there is
    /// room for one.
    fn pick_worker(&mut self) -> Option<u64> {
        let lazy = self.options.lazy_start;
        let candidate = self
            .workers
            .find(|worker| worker.can_accept_work() && (lazy || worker.is_process_alive()))
            .map(Worker::id);

        let picked = if lazy {
            match candidate {
                Some(worker_id) => Some(worker_id),
                None if self.can_start_worker() => self.try_start_worker(),
                None => None,
            }
        } else {
            if self.can_start_worker() {
                self.try_start_worker();
            }
            candidate
        };

        if let Some(worker_id) = picked {
            self.workers.requeue_by(|worker| worker.id() == worker_id);
        }
        picked
    }

    fn pick_worker_ref(&mut self) -> Option<&Worker> {
        let worker_id = self.pick_worker()?;
        self.workers.find(|worker| worker.id() == worker_id)
    }

    fn dispatch_next(&mut self, worker_id: u64) {
        let task_timeout = self.options.task_timeout;
        let events = self.events.clone();
        let Some(worker) = self.workers.find_mut(|worker| worker.id() == worker_id) else {
            return;
        };
        let Some(mut task) = self.pending.dequeue() else {
            return;
        };

        self.ongoing.enqueue(task.id);
        if let Some(task_timeout) = task_timeout {
            let call_id = task.id;
            let timer = tokio::spawn(async move {
                tokio::time::sleep(task_timeout).await;
                let _ = events.send(WorkerEvent::CallTimedOut { worker_id, call_id });
            });
            task.set_timer(timer.abort_handle());
        }
        trace!(worker_id, call_id = task.id, retries = task.retries, "dispatching call");
        worker.handle(task);
    }

    fn on_worker_ready(&mut self, worker_id: u64) {
        let Some(worker) = self.workers.find_mut(|worker| worker.id() == worker_id) else {
            return;
        };
        worker.mark_ready();
        self.startup_failures = 0;
        info!(worker_id, "worker ready");
        self.check_readiness();
        self.process_queue();
    }

    fn on_response(&mut self, worker_id: u64, response: Response) {
        let call_id = response.call_id;
        let Some(worker) = self.workers.find_mut(|worker| worker.id() == worker_id) else {
            debug!(worker_id, call_id, "response from a removed worker ignored");
            return;
        };
        if worker.is_terminating() {
            trace!(worker_id, call_id, "response from a terminating worker ignored");
            return;
        }
        let Some(task) = worker.take_call(call_id) else {
            warn!(worker_id, call_id, "orphan response");
            return;
        };
        if worker.is_exhausted() && !worker.is_busy() {
            info!(worker_id, "worker reached its endurance, recycling it");
            worker.stop();
        }

        self.ongoing.remove(&task.id);
        match response.into_result() {
            Ok(value) => task.resolve(value),
            Err(err) => task.reject(PoolError::Remote(err)),
        }
        self.process_queue();
    }

    fn on_call_timeout(&mut self, worker_id: u64, call_id: u64) {
        let Some(worker) = self.workers.find_mut(|worker| worker.id() == worker_id) else {
            return;
        };
        if !worker.has_call(call_id) {
            trace!(worker_id, call_id, "stale call timer ignored");
            return;
        }
        let tasks = worker.withdraw_tasks();
        warn!(
            worker_id,
            call_id,
            rejected = tasks.len(),
            "call timed out, stopping worker"
        );
        worker.stop();

        for task in tasks {
            self.ongoing.remove(&task.id);
            task.reject(PoolError::Timeout);
        }
    }

    fn on_worker_exit(&mut self, worker_id: u64, code: Option<i32>) {
        let Some(mut worker) = self.workers.remove_by(|worker| worker.id() == worker_id) else {
            return;
        };
        let stop_requested = worker.is_terminating();
        let was_ready = worker.is_process_alive();
        worker.mark_exited();
        let tasks = worker.withdraw_tasks();
        drop(worker);

        if tasks.is_empty() {
            debug!(worker_id, ?code, "worker exited");
        } else {
            warn!(
                worker_id,
                ?code,
                in_flight = tasks.len(),
                "worker exited with calls in flight"
            );
        }

        let max_retries = self.options.task_max_retries;
        for mut task in tasks {
            self.ongoing.remove(&task.id);
            if task.has_reached_retry_limit(max_retries) {
                let retries = task.retries;
                task.reject(PoolError::ProcessTerminated { retries });
            } else {
                task.clear_timer();
                task.increment_retries();
                debug!(call_id = task.id, retries = task.retries, "retrying call");
                self.pending.enqueue(task);
            }
        }

        if !was_ready && !stop_requested {
            self.startup_failures += 1;
            if self.startup_failures >= MAX_STARTUP_FAILURES {
                error!(
                    worker_id,
                    ?code,
                    failures = self.startup_failures,
                    "workers keep exiting during startup, not respawning"
                );
                let err = PoolError::Spawn(format!(
                    "worker exited during startup {} times in a row (last exit code {code:?})",
                    self.startup_failures
                ));
                self.reject_pending(&err);
                self.check_shutdown();
                return;
            }
        }

        if self.can_start_worker() {
            self.try_start_worker();
        }
        self.process_queue();
    }

    fn can_start_worker(&self) -> bool {
        !self.termination_started && !self.workers.is_full()
    }

    fn start_worker(&mut self) -> Result<u64, PoolError> {
        let worker = Worker::spawn(
            &self.worker_options,
            self.bridge.as_ref(),
            self.events.clone(),
        )?;
        let worker_id = worker.id();
        self.workers.enqueue(worker);
        debug!(worker_id, workers = self.workers.len(), "worker started");
        Ok(worker_id)
    }

    fn try_start_worker(&mut self) -> Option<u64> {
        match self.start_worker() {
            Ok(worker_id) => Some(worker_id),
            Err(err) => {
                error!(?err, "failed to start worker");
                if !self.workers.iter().any(|worker| !worker.is_terminating()) {
                    self.reject_pending(&err);
                }
                None
            }
        }
    }

    fn reject_pending(&mut self, err: &PoolError) {
        for task in self.pending.drain() {
            task.reject(err.clone());
        }
    }

    fn check_readiness(&mut self) {
        if self.is_ready {
            return;
        }
        let operational = self
            .workers
            .iter()
            .filter(|worker| worker.is_operational())
            .count();
        if operational < self.options.min_workers {
            return;
        }
        self.is_ready = true;
        info!(operational, "worker pool ready");
        for waiter in self.ready_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn terminate(&mut self, reply: oneshot::Sender<()>) {
        if self.terminated {
            let _ = reply.send(());
            return;
        }
        self.termination_waiters.push(reply);
        if !self.termination_started {
            self.termination_started = true;
            info!(
                workers = self.workers.len(),
                pending = self.pending.len(),
                ongoing = self.ongoing.len(),
                "terminating worker pool"
            );
        }
        self.process_queue();
    }

    /// Stop idle workers once termination started, and finish it when every
    /// worker is gone.
    fn check_shutdown(&mut self) {
        if !self.termination_started || self.terminated {
            return;
        }
        for worker in self.workers.iter_mut() {
            if !worker.is_busy() {
                worker.stop();
            }
        }
        if !self.workers.is_empty() {
            return;
        }

        self.terminated = true;
        self.reject_pending(&PoolError::ShuttingDown);
        if let Some(bridge) = &self.bridge {
            bridge.shutdown();
        }
        info!("worker pool terminated");
        for waiter in self.termination_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    /// Every handle is gone: stop the workers without waiting for them.
    fn shutdown_now(&mut self) {
        debug!(workers = self.workers.len(), "worker pool handles dropped, stopping workers");
        self.termination_started = true;
        for worker in self.workers.iter_mut() {
            for task in worker.withdraw_tasks() {
                task.reject(PoolError::Closed);
            }
            worker.stop();
        }
        self.reject_pending(&PoolError::Closed);
    }

    fn stats(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            total_workers: self.workers.len(),
            operational_workers: self
                .workers
                .iter()
                .filter(|worker| worker.is_operational())
                .count(),
            busy_workers: self.workers.iter().filter(|worker| worker.is_busy()).count(),
            pending_tasks: self.pending.len(),
            ongoing_tasks: self.ongoing.len(),
            is_ready: self.is_ready,
            termination_started: self.termination_started,
            terminated: self.terminated,
        }
    }
}

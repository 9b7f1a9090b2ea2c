//! Pool configuration and the per-worker settings derived from it.

use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

use crate::{errors::PoolError, runtime::ModuleRegistry, transport::DEFAULT_MAX_MESSAGE_SIZE};

/// How workers are isolated from the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WorkerType {
    /// Each worker is a child process running `worker_program`.
    #[default]
    Process,
    /// Each worker is an OS thread running a module from `modules`.
    Thread,
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process => f.write_str("process"),
            Self::Thread => f.write_str("thread"),
        }
    }
}

impl FromStr for WorkerType {
    type Err = PoolError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "process" => Ok(Self::Process),
            "thread" => Ok(Self::Thread),
            other => Err(PoolError::Config(format!("unknown worker type: {other}"))),
        }
    }
}

/// Limits applied to thread workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Stack size of the worker thread, in MiB.
    pub stack_size_mb: Option<usize>,
    /// Cap on the blocking pool of the worker's own runtime.
    pub max_blocking_threads: Option<usize>,
}

#[derive(Clone, Debug)]
pub struct PoolOptions {
    /// Start workers at construction instead of on the first call.
    pub auto_start: bool,
    /// Dispatch to workers that are still starting up and only grow the pool
    /// when every existing worker is saturated.
    pub lazy_start: bool,
    /// Wait for the module initializer before a worker reports ready.
    pub async_worker_initialization: bool,
    pub min_workers: usize,
    pub max_workers: usize,
    /// Cap on calls in flight across the pool; `None` means unbounded.
    pub max_tasks: Option<usize>,
    pub max_tasks_per_worker: usize,
    pub task_timeout: Option<Duration>,
    /// Re-dispatch attempts after a worker crash. `u32::MAX` retries forever.
    pub task_max_retries: u32,
    /// Calls a worker serves before it is recycled; `None` means forever.
    pub worker_endurance: Option<usize>,
    /// Grace period between a polite exit request and a forced kill.
    pub worker_stop_timeout: Duration,
    pub worker_type: WorkerType,
    pub resource_limits: Option<ResourceLimits>,
    pub max_message_size: usize,
    /// Executable launched for process workers.
    pub worker_program: Option<PathBuf>,
    /// Arguments passed before the bridge arguments.
    pub worker_args: Vec<String>,
    /// Modules available to thread workers.
    pub modules: ModuleRegistry,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            auto_start: false,
            lazy_start: false,
            async_worker_initialization: false,
            min_workers: 0,
            max_workers: num_cpus::get().max(1),
            max_tasks: None,
            max_tasks_per_worker: 1,
            task_timeout: None,
            task_max_retries: 0,
            worker_endurance: None,
            worker_stop_timeout: Duration::from_millis(100),
            worker_type: WorkerType::Process,
            resource_limits: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            worker_program: None,
            worker_args: Vec::new(),
            modules: ModuleRegistry::new(),
        }
    }
}

impl PoolOptions {
    /// Options for a pool of child processes running `program`.
    pub fn process(program: impl Into<PathBuf>) -> Self {
        Self {
            worker_type: WorkerType::Process,
            worker_program: Some(program.into()),
            ..Self::default()
        }
    }

    /// Options for a pool of threads serving modules from `modules`.
    pub fn thread(modules: ModuleRegistry) -> Self {
        Self {
            worker_type: WorkerType::Thread,
            modules,
            ..Self::default()
        }
    }

    pub fn with_workers(mut self, min_workers: usize, max_workers: usize) -> Self {
        self.min_workers = min_workers;
        self.max_workers = max_workers;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    pub fn with_worker_args(mut self, args: Vec<String>) -> Self {
        self.worker_args = args;
        self
    }

    pub fn has_timeout(&self) -> bool {
        self.task_timeout.is_some()
    }

    /// Validate the options and derive the settings every worker shares.
    pub(crate) fn worker_options(&self, module_path: &str) -> Result<WorkerOptions, PoolError> {
        if self.max_workers == 0 {
            return Err(PoolError::Config("max_workers must be at least 1".into()));
        }
        if self.min_workers > self.max_workers {
            return Err(PoolError::Config(format!(
                "min_workers ({}) exceeds max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        if self.max_tasks_per_worker == 0 {
            return Err(PoolError::Config(
                "max_tasks_per_worker must be at least 1".into(),
            ));
        }
        if self.max_tasks == Some(0) {
            return Err(PoolError::Config("max_tasks must be at least 1".into()));
        }
        if self.worker_endurance == Some(0) {
            return Err(PoolError::Config(
                "worker_endurance must be at least 1".into(),
            ));
        }

        let program = match self.worker_type {
            WorkerType::Process => {
                if self.resource_limits.is_some() {
                    return Err(PoolError::Config(
                        "resource limits are only supported for thread workers".into(),
                    ));
                }
                let program = self.worker_program.clone().ok_or_else(|| {
                    PoolError::Config("process workers require a worker program".into())
                })?;
                Some(program)
            }
            WorkerType::Thread => {
                if !self.modules.contains(module_path) {
                    return Err(PoolError::Config(format!(
                        "module {module_path:?} is not registered for thread workers"
                    )));
                }
                None
            }
        };

        Ok(WorkerOptions {
            module_path: module_path.to_string(),
            worker_type: self.worker_type,
            max_tasks: self.max_tasks_per_worker,
            endurance: self.worker_endurance,
            stop_timeout: self.worker_stop_timeout,
            async_initialization: self.async_worker_initialization,
            resource_limits: self.resource_limits,
            max_message_size: self.max_message_size,
            program,
            program_args: self.worker_args.clone(),
            modules: self.modules.clone(),
        })
    }
}

/// Settings every worker of one pool is spawned with.
#[derive(Clone, Debug)]
pub(crate) struct WorkerOptions {
    pub(crate) module_path: String,
    pub(crate) worker_type: WorkerType,
    pub(crate) max_tasks: usize,
    pub(crate) endurance: Option<usize>,
    pub(crate) stop_timeout: Duration,
    pub(crate) async_initialization: bool,
    pub(crate) resource_limits: Option<ResourceLimits>,
    pub(crate) max_message_size: usize,
    pub(crate) program: Option<PathBuf>,
    pub(crate) program_args: Vec<String>,
    pub(crate) modules: ModuleRegistry,
}

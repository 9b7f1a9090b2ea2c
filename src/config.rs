//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `WORKER_NODES_WORKER_TYPE`: `process` or `thread` (default: process)
//! - `WORKER_NODES_WORKER_PROGRAM`: executable for process workers (optional)
//! - `WORKER_NODES_AUTO_START`: start workers at construction (default: false)
//! - `WORKER_NODES_LAZY_START`: lazy worker selection (default: false)
//! - `WORKER_NODES_ASYNC_WORKER_INITIALIZATION`: wait for module init before ready (default: false)
//! - `WORKER_NODES_MIN_WORKERS`: workers required before ready (default: 0)
//! - `WORKER_NODES_MAX_WORKERS`: worker cap (default: num_cpus)
//! - `WORKER_NODES_MAX_TASKS`: pool-wide concurrent call cap (default: unbounded)
//! - `WORKER_NODES_MAX_TASKS_PER_WORKER`: concurrent calls per worker (default: 1)
//! - `WORKER_NODES_TASK_TIMEOUT_MS`: per-call timeout (default: none)
//! - `WORKER_NODES_TASK_MAX_RETRIES`: re-dispatches after a crash (default: 0)
//! - `WORKER_NODES_WORKER_ENDURANCE`: calls per worker before recycling (default: none)
//! - `WORKER_NODES_WORKER_STOP_TIMEOUT_MS`: grace before a forced kill (default: 100)
//! - `WORKER_NODES_MAX_MESSAGE_SIZE`: largest accepted frame in bytes (default: 16 MiB)

use std::{env, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result};

use crate::options::{PoolOptions, WorkerType};

impl PoolOptions {
    /// Load options from the environment, reading `.env` first when present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build options from an arbitrary variable lookup.
    ///
    /// Numbers that fail to parse fall back to their defaults; an unknown
    /// worker type is an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parsed = |name: &str| lookup(name).and_then(|raw| raw.trim().parse::<u64>().ok());
        let flag = |name: &str, default: bool| {
            lookup(name)
                .map(|raw| matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(default)
        };

        let worker_type = match lookup("WORKER_NODES_WORKER_TYPE") {
            Some(raw) => WorkerType::from_str(&raw)
                .context("invalid WORKER_NODES_WORKER_TYPE value")?,
            None => defaults.worker_type,
        };

        let worker_program = lookup("WORKER_NODES_WORKER_PROGRAM")
            .filter(|raw| !raw.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            auto_start: flag("WORKER_NODES_AUTO_START", defaults.auto_start),
            lazy_start: flag("WORKER_NODES_LAZY_START", defaults.lazy_start),
            async_worker_initialization: flag(
                "WORKER_NODES_ASYNC_WORKER_INITIALIZATION",
                defaults.async_worker_initialization,
            ),
            min_workers: parsed("WORKER_NODES_MIN_WORKERS")
                .map(|value| value as usize)
                .unwrap_or(defaults.min_workers),
            max_workers: parsed("WORKER_NODES_MAX_WORKERS")
                .map(|value| value as usize)
                .unwrap_or(defaults.max_workers),
            max_tasks: parsed("WORKER_NODES_MAX_TASKS")
                .map(|value| value as usize)
                .or(defaults.max_tasks),
            max_tasks_per_worker: parsed("WORKER_NODES_MAX_TASKS_PER_WORKER")
                .map(|value| value as usize)
                .unwrap_or(defaults.max_tasks_per_worker),
            task_timeout: parsed("WORKER_NODES_TASK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .or(defaults.task_timeout),
            task_max_retries: parsed("WORKER_NODES_TASK_MAX_RETRIES")
                .map(|value| u32::try_from(value).unwrap_or(u32::MAX))
                .unwrap_or(defaults.task_max_retries),
            worker_endurance: parsed("WORKER_NODES_WORKER_ENDURANCE")
                .map(|value| value as usize)
                .or(defaults.worker_endurance),
            worker_stop_timeout: parsed("WORKER_NODES_WORKER_STOP_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.worker_stop_timeout),
            max_message_size: parsed("WORKER_NODES_MAX_MESSAGE_SIZE")
                .map(|value| value as usize)
                .unwrap_or(defaults.max_message_size),
            worker_type,
            worker_program: worker_program.or(defaults.worker_program),
            ..defaults
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serial_test::serial;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let options = PoolOptions::from_lookup(|_| None).unwrap();
        let defaults = PoolOptions::default();
        assert_eq!(options.max_workers, defaults.max_workers);
        assert_eq!(options.worker_type, WorkerType::Process);
        assert!(options.worker_program.is_none());
        assert!(options.task_timeout.is_none());
    }

    #[test]
    fn values_are_read_from_lookup() {
        let options = PoolOptions::from_lookup(lookup_from(&[
            ("WORKER_NODES_WORKER_TYPE", "thread"),
            ("WORKER_NODES_LAZY_START", "true"),
            ("WORKER_NODES_MIN_WORKERS", "2"),
            ("WORKER_NODES_MAX_WORKERS", "6"),
            ("WORKER_NODES_MAX_TASKS", "40"),
            ("WORKER_NODES_TASK_TIMEOUT_MS", "1500"),
            ("WORKER_NODES_TASK_MAX_RETRIES", "3"),
            ("WORKER_NODES_WORKER_ENDURANCE", "100"),
        ]))
        .unwrap();

        assert_eq!(options.worker_type, WorkerType::Thread);
        assert!(options.lazy_start);
        assert_eq!(options.min_workers, 2);
        assert_eq!(options.max_workers, 6);
        assert_eq!(options.max_tasks, Some(40));
        assert_eq!(options.task_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(options.task_max_retries, 3);
        assert_eq!(options.worker_endurance, Some(100));
    }

    #[test]
    fn unparsable_numbers_fall_back_to_defaults() {
        let options = PoolOptions::from_lookup(lookup_from(&[
            ("WORKER_NODES_MAX_TASKS_PER_WORKER", "many"),
            ("WORKER_NODES_WORKER_STOP_TIMEOUT_MS", "-5"),
        ]))
        .unwrap();
        assert_eq!(options.max_tasks_per_worker, 1);
        assert_eq!(options.worker_stop_timeout, Duration::from_millis(100));
    }

    #[test]
    fn unknown_worker_type_is_an_error() {
        let result = PoolOptions::from_lookup(lookup_from(&[("WORKER_NODES_WORKER_TYPE", "green")]));
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn from_env_reads_process_environment() {
        // SAFETY: serialized with every other test touching the environment.
        unsafe {
            env::set_var("WORKER_NODES_WORKER_PROGRAM", "/usr/local/bin/worker");
            env::set_var("WORKER_NODES_MAX_WORKERS", "3");
        }
        let options = PoolOptions::from_env().unwrap();
        unsafe {
            env::remove_var("WORKER_NODES_WORKER_PROGRAM");
            env::remove_var("WORKER_NODES_MAX_WORKERS");
        }

        assert_eq!(
            options.worker_program,
            Some(PathBuf::from("/usr/local/bin/worker"))
        );
        assert_eq!(options.max_workers, 3);
    }
}

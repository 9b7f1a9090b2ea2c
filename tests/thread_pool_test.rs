//! End-to-end tests for pools of thread workers.

use std::{
    future::Future,
    sync::{
        Arc, Once,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use worker_nodes::{
    Diagnostic, ErrorKind, ErrorRecord, Module, ModuleRegistry, PoolError, PoolOptions, Value,
    WorkerHandle, WorkerPool,
};

static INIT_TRACING: Once = Once::new();

fn init_tracing() {
    INIT_TRACING.call_once(|| {
        if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .init();
        }
    });
}

/// Every loaded module instance gets its own token, so tests can tell which
/// worker served a call.
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);
static PANICKED_ONCE: AtomicBool = AtomicBool::new(false);
static INITIALIZED: AtomicBool = AtomicBool::new(false);
static PROFILED: AtomicBool = AtomicBool::new(false);

const WAIT: Duration = Duration::from_secs(10);

async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("test step timed out")
}

fn fixture_module() -> Module {
    let token = NEXT_TOKEN.fetch_add(1, Ordering::SeqCst);
    Module::new()
        .method("whoami", move |_| async move { Ok(Value::from(token)) })
        .method("add", |args: Vec<Value>| async move {
            let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
            Ok(Value::from(sum))
        })
        .method("echo", |args: Vec<Value>| async move {
            Ok(args.into_iter().next().unwrap_or(Value::Nil))
        })
        .method("sleep", |args: Vec<Value>| async move {
            let ms = args.first().and_then(Value::as_u64).unwrap_or_default();
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(Value::from(ms))
        })
        .method("block", |args: Vec<Value>| async move {
            let ms = args.first().and_then(Value::as_u64).unwrap_or_default();
            std::thread::sleep(Duration::from_millis(ms));
            Ok(Value::Nil)
        })
        .method("panic", |args: Vec<Value>| async move {
            if args.is_empty() {
                panic!("fixture panic");
            }
            Ok(Value::Nil)
        })
        .method("panicOnce", |_| async {
            if !PANICKED_ONCE.swap(true, Ordering::SeqCst) {
                panic!("first call panics");
            }
            Ok(Value::from("recovered"))
        })
        .method("validate", |_| async {
            Err(ErrorRecord::new("ValidationError", "value out of bounds")
                .with_field("code", "E42")
                .with_field("limit", 10))
        })
        .callable(|args: Vec<Value>| async move { Ok(Value::from(args.len() as u64)) })
}

/// `overlap(ms)` holds a slot for `ms` and returns the most calls this
/// module instance ever had in flight at once.
fn overlap_module() -> Module {
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    Module::new().method("overlap", move |args: Vec<Value>| {
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        async move {
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            let ms = args.first().and_then(Value::as_u64).unwrap_or_default();
            tokio::time::sleep(Duration::from_millis(ms)).await;
            current.fetch_sub(1, Ordering::SeqCst);
            Ok(Value::from(peak.load(Ordering::SeqCst) as u64))
        }
    })
}

fn registry() -> ModuleRegistry {
    ModuleRegistry::new()
        .register("fixture", fixture_module)
        .register("overlap", overlap_module)
        .register("slow-init", || {
            Module::new()
                .on_init(|| async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    INITIALIZED.store(true, Ordering::SeqCst);
                    Ok(())
                })
                .method("initialized", |_| async {
                    Ok(Value::from(INITIALIZED.load(Ordering::SeqCst)))
                })
        })
        .register("broken-init", || {
            Module::new().on_init(|| async { Err(ErrorRecord::new("Error", "cannot initialize")) })
        })
        .register("profiled", || {
            Module::new().on_diagnostic(|diagnostic| {
                if matches!(diagnostic, Diagnostic::Profile { .. }) {
                    PROFILED.store(true, Ordering::SeqCst);
                }
            })
        })
}

fn options(min_workers: usize, max_workers: usize) -> PoolOptions {
    PoolOptions {
        auto_start: true,
        ..PoolOptions::thread(registry()).with_workers(min_workers, max_workers)
    }
}

async fn start(options: PoolOptions) -> WorkerPool {
    init_tracing();
    let pool = WorkerPool::new("fixture", options).expect("pool should start");
    within(pool.ready()).await.expect("pool should become ready")
}

async fn whoami(pool: &WorkerPool) -> u64 {
    within(pool.call("whoami", vec![]))
        .await
        .expect("whoami should succeed")
        .as_u64()
        .expect("token is an integer")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn serves_named_and_module_calls() {
    let pool = start(options(1, 2)).await;

    let sum = within(pool.call("add", vec![Value::from(1), Value::from(2)])).await;
    assert_eq!(sum, Ok(Value::from(3)));

    let arity = within(pool.call_module(vec![Value::Nil, Value::Nil, Value::Nil])).await;
    assert_eq!(arity, Ok(Value::from(3u64)));

    let typed: i64 = within(pool.call_as("add", vec![Value::from(40), Value::from(2)]))
        .await
        .expect("typed call should succeed");
    assert_eq!(typed, 42);

    within(pool.terminate()).await.expect("terminate");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_method_is_a_type_error() {
    let pool = start(options(1, 1)).await;

    let err = within(pool.call("missing", vec![]))
        .await
        .expect_err("missing method should fail");
    let remote = err.as_remote().expect("remote error");
    assert_eq!(remote.kind(), ErrorKind::TypeError);
    assert_eq!(remote.message(), "missing is not a function");
    assert!(remote.stack().is_some_and(|stack| stack.contains("fixture::missing")));

    within(pool.terminate()).await.expect("terminate");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn custom_error_fields_reach_the_caller() {
    let pool = start(options(1, 1)).await;

    let err = within(pool.call("validate", vec![]))
        .await
        .expect_err("validate always fails");
    assert_eq!(err.to_string(), "ValidationError: value out of bounds");
    let remote = err.as_remote().expect("remote error");
    assert_eq!(remote.kind(), ErrorKind::Error);
    assert_eq!(remote.type_name(), "ValidationError");
    assert_eq!(remote.field("code"), Some(&Value::from("E42")));
    assert_eq!(remote.field("limit"), Some(&Value::from(10)));

    within(pool.terminate()).await.expect("terminate");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn binary_payloads_round_trip() {
    let pool = start(options(1, 1)).await;

    let payload = Value::Binary(vec![0, 1, 2, 127, 128, 255]);
    let echoed = within(pool.call("echo", vec![payload.clone()])).await;
    assert_eq!(echoed, Ok(payload));

    within(pool.terminate()).await.expect("terminate");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_worker_serves_every_call() {
    let pool = start(options(1, 1)).await;

    let first = whoami(&pool).await;
    for _ in 0..3 {
        assert_eq!(whoami(&pool).await, first);
    }
    assert_eq!(within(pool.workers()).await.expect("workers").len(), 1);

    within(pool.terminate()).await.expect("terminate");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lazy_pool_grows_only_when_workers_are_saturated() {
    init_tracing();
    let pool = WorkerPool::new(
        "fixture",
        PoolOptions {
            lazy_start: true,
            ..PoolOptions::thread(registry()).with_workers(0, 3)
        },
    )
    .expect("pool should start");

    assert!(within(pool.workers()).await.expect("workers").is_empty());

    for _ in 0..3 {
        within(pool.call("add", vec![Value::from(1)]))
            .await
            .expect("call should succeed");
    }
    assert_eq!(within(pool.workers()).await.expect("workers").len(), 1);

    let calls: Vec<_> = (0..3)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.call("sleep", vec![Value::from(200)]).await })
        })
        .collect();
    for call in calls {
        let result = within(call).await.expect("call task");
        assert_eq!(result, Ok(Value::from(200)));
    }
    assert_eq!(within(pool.workers()).await.expect("workers").len(), 3);

    within(pool.terminate()).await.expect("terminate");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lazy_pool_keeps_its_minimum_and_queues_beyond_max() {
    let pool = start(PoolOptions {
        lazy_start: true,
        ..options(1, 3)
    })
    .await;
    assert_eq!(within(pool.workers()).await.expect("workers").len(), 1);

    let first = whoami(&pool).await;
    for _ in 0..2 {
        assert_eq!(whoami(&pool).await, first);
    }
    assert_eq!(within(pool.workers()).await.expect("workers").len(), 1);

    let calls: Vec<_> = (0..4)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.call("sleep", vec![Value::from(400)]).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stats = within(pool.stats()).await.expect("stats");
    assert_eq!(stats.total_workers, 3);
    assert_eq!(stats.pending_tasks, 1);
    assert_eq!(stats.ongoing_tasks, 3);

    for call in calls {
        let result = within(call).await.expect("call task");
        assert_eq!(result, Ok(Value::from(400)));
    }
    assert_eq!(within(pool.workers()).await.expect("workers").len(), 3);

    within(pool.terminate()).await.expect("terminate");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn workers_never_exceed_their_task_limit() {
    init_tracing();
    let pool = WorkerPool::new(
        "overlap",
        PoolOptions {
            auto_start: true,
            max_tasks_per_worker: 2,
            ..PoolOptions::thread(registry()).with_workers(2, 2)
        },
    )
    .expect("pool should start");
    let pool = within(pool.ready()).await.expect("pool should become ready");

    let calls: Vec<_> = (0..8)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.call("overlap", vec![Value::from(100)]).await })
        })
        .collect();

    let mut peaks = Vec::new();
    for call in calls {
        let peak = within(call)
            .await
            .expect("call task")
            .expect("overlap should succeed")
            .as_u64()
            .expect("peak is an integer");
        peaks.push(peak);
    }
    assert!(peaks.iter().all(|&peak| peak <= 2), "peaks: {peaks:?}");
    assert_eq!(peaks.iter().max(), Some(&2));

    within(pool.terminate()).await.expect("terminate");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_workers_are_recycled() {
    let pool = start(PoolOptions {
        worker_endurance: Some(2),
        ..options(1, 1)
    })
    .await;

    let first = whoami(&pool).await;
    assert_eq!(whoami(&pool).await, first);
    let replacement = whoami(&pool).await;
    assert_ne!(replacement, first);
    assert_eq!(whoami(&pool).await, replacement);

    within(pool.terminate()).await.expect("terminate");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn admission_rejects_calls_over_max_tasks() {
    let pool = start(PoolOptions {
        max_tasks: Some(1),
        ..options(1, 1)
    })
    .await;

    let in_flight = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.call("sleep", vec![Value::from(300)]).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = within(pool.call("add", vec![]))
        .await
        .expect_err("second call should be refused");
    assert_eq!(err, PoolError::MaxConcurrentCalls(1));
    assert_eq!(err.to_string(), "Too many concurrent calls (1)");

    assert_eq!(within(in_flight).await.expect("call task"), Ok(Value::from(300)));
    within(pool.terminate()).await.expect("terminate");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timed_out_calls_replace_their_worker() {
    let pool = start(options(1, 1).with_task_timeout(Duration::from_millis(200))).await;

    let first = whoami(&pool).await;
    let err = within(pool.call("block", vec![Value::from(1500)]))
        .await
        .expect_err("blocking call should time out");
    assert_eq!(err, PoolError::Timeout);
    assert_eq!(err.to_string(), "worker call timed out!");

    let replacement = whoami(&pool).await;
    assert_ne!(replacement, first);

    within(pool.terminate()).await.expect("terminate");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timeouts_reject_every_call_on_the_worker() {
    let pool = start(PoolOptions {
        max_tasks_per_worker: 2,
        ..options(1, 1).with_task_timeout(Duration::from_millis(300))
    })
    .await;

    let first = whoami(&pool).await;
    let blocked = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.call("block", vec![Value::from(1500)]).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let bystander = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.call("sleep", vec![Value::from(50)]).await })
    };

    assert_eq!(within(blocked).await.expect("call task"), Err(PoolError::Timeout));
    assert_eq!(within(bystander).await.expect("call task"), Err(PoolError::Timeout));

    let replacement = whoami(&pool).await;
    assert_ne!(replacement, first);

    within(pool.terminate()).await.expect("terminate");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crashing_calls_give_up_after_max_retries() {
    let pool = start(PoolOptions {
        task_max_retries: 2,
        ..options(1, 1)
    })
    .await;

    let err = within(pool.call("panic", vec![]))
        .await
        .expect_err("panicking call should fail");
    assert_eq!(err, PoolError::ProcessTerminated { retries: 2 });
    assert_eq!(err.to_string(), "cancel after 2 retries!");

    let sum = within(pool.call("add", vec![Value::from(5)])).await;
    assert_eq!(sum, Ok(Value::from(5)));

    within(pool.terminate()).await.expect("terminate");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crashed_calls_are_retried_on_a_new_worker() {
    let pool = start(PoolOptions {
        task_max_retries: 1,
        ..options(1, 1)
    })
    .await;

    let result = within(pool.call("panicOnce", vec![])).await;
    assert_eq!(result, Ok(Value::from("recovered")));

    within(pool.terminate()).await.expect("terminate");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crashes_without_retries_reject_immediately() {
    let pool = start(options(1, 1)).await;

    let err = within(pool.call("panic", vec![]))
        .await
        .expect_err("panicking call should fail");
    assert_eq!(err, PoolError::ProcessTerminated { retries: 0 });

    within(pool.terminate()).await.expect("terminate");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn terminate_lets_in_flight_calls_finish() {
    let pool = start(options(1, 1)).await;

    let in_flight = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.call("sleep", vec![Value::from(200)]).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    within(pool.terminate()).await.expect("terminate");
    assert_eq!(within(in_flight).await.expect("call task"), Ok(Value::from(200)));

    let stats = within(pool.stats()).await.expect("stats");
    assert!(stats.termination_started);
    assert!(stats.terminated);
    assert_eq!(stats.total_workers, 0);

    let err = within(pool.call("add", vec![]))
        .await
        .expect_err("calls after terminate are refused");
    assert_eq!(err, PoolError::ShuttingDown);

    // A second terminate resolves right away.
    within(pool.terminate()).await.expect("terminate again");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reports_workers_and_stats() {
    let pool = start(PoolOptions {
        resource_limits: Some(worker_nodes::ResourceLimits {
            stack_size_mb: Some(4),
            max_blocking_threads: Some(2),
        }),
        ..options(2, 2)
    })
    .await;

    let stats = within(pool.stats()).await.expect("stats");
    assert!(stats.is_ready);
    assert_eq!(stats.total_workers, 2);
    assert_eq!(stats.operational_workers, 2);
    assert_eq!(stats.pending_tasks, 0);
    assert_eq!(stats.ongoing_tasks, 0);

    let handles = within(pool.used_workers()).await.expect("used workers");
    assert_eq!(handles.len(), 2);
    for handle in handles {
        match handle {
            WorkerHandle::Thread {
                name,
                resource_limits,
            } => {
                assert!(name.starts_with("worker-nodes-"));
                assert_eq!(resource_limits.and_then(|limits| limits.stack_size_mb), Some(4));
            }
            other => panic!("expected a thread worker, got {other:?}"),
        }
    }

    let workers = within(pool.workers()).await.expect("workers");
    assert!(workers.iter().all(|worker| worker.is_operational));
    assert!(workers.iter().all(|worker| worker.start_date.is_some()));

    within(pool.terminate()).await.expect("terminate");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_initialization_finishes_before_ready() {
    init_tracing();
    let pool = WorkerPool::new(
        "slow-init",
        PoolOptions {
            async_worker_initialization: true,
            ..options(1, 1)
        },
    )
    .expect("pool should start");
    let pool = within(pool.ready()).await.expect("ready");

    assert!(INITIALIZED.load(Ordering::SeqCst));
    let initialized = within(pool.call("initialized", vec![])).await;
    assert_eq!(initialized, Ok(Value::from(true)));

    within(pool.terminate()).await.expect("terminate");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn workers_failing_at_startup_stop_being_respawned() {
    init_tracing();
    let pool = WorkerPool::new(
        "broken-init",
        PoolOptions {
            async_worker_initialization: true,
            auto_start: false,
            ..PoolOptions::thread(registry()).with_workers(0, 1)
        },
    )
    .expect("pool should start");

    let err = within(pool.call("anything", vec![]))
        .await
        .expect_err("no worker can start");
    assert!(matches!(err, PoolError::Spawn(_)), "unexpected error: {err:?}");

    within(pool.terminate()).await.expect("terminate");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn profiler_requests_reach_the_module() {
    init_tracing();
    let pool = WorkerPool::new("profiled", options(1, 1)).expect("pool should start");
    let pool = within(pool.ready()).await.expect("ready");

    pool.profiler(Duration::from_millis(10)).expect("profiler");
    within(async {
        while !PROFILED.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    within(pool.terminate()).await.expect("terminate");
}

#[tokio::test]
async fn rejects_unregistered_modules() {
    let result = WorkerPool::new("nowhere", PoolOptions::thread(registry()));
    assert!(matches!(result, Err(PoolError::Config(_))));
}

#[tokio::test]
async fn rejects_inverted_worker_bounds() {
    let result = WorkerPool::new("fixture", PoolOptions::thread(registry()).with_workers(3, 1));
    assert!(matches!(result, Err(PoolError::Config(_))));
}

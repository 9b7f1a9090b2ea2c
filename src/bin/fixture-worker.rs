//! Fixture Worker - a process worker serving the `fixture` module.
//!
//! Used by the integration tests and handy for trying a pool by hand:
//!
//! ```text
//! WORKER_NODES_WORKER_PROGRAM=target/debug/fixture-worker
//! ```
//!
//! Methods:
//! - `echo(value)`: returns its first argument
//! - `add(a, b, ...)`: sums integer arguments
//! - `pid()`: the worker's process id
//! - `sleep(ms)`: waits, then returns `ms`
//! - `hang()`: blocks the worker forever
//! - `crash(code)`: exits the process immediately
//! - `panic()`: panics inside the module
//! - `chatty(lines)`: prints `lines` lines to stdout, then returns `lines`
//! - `typeError(message)`: fails with a `TypeError`
//! - `customError(message)`: fails with an error carrying extra fields
//!
//! Calling the module itself returns the number of arguments. Each worker
//! prints a banner to stdout while it initializes.

use std::{
    io::{BufWriter, Write},
    time::Duration,
};

use anyhow::Result;
use tracing::info;

use worker_nodes::{
    ErrorRecord, Module, ModuleRegistry, Value,
    observability::{self, ObservabilityOptions},
    run_process_worker,
};

fn first_u64(args: &[Value]) -> u64 {
    args.first().and_then(Value::as_u64).unwrap_or_default()
}

fn first_str(args: &[Value]) -> String {
    args.first()
        .and_then(Value::as_str)
        .unwrap_or("fixture failure")
        .to_string()
}

/// Blocks the worker's only thread, so nothing but a kill ends it.
fn block_forever() -> Result<Value, ErrorRecord> {
    loop {
        std::thread::sleep(Duration::from_secs(60));
    }
}

fn exit_now(code: i32) -> Result<Value, ErrorRecord> {
    std::process::exit(code.max(1))
}

fn fail_hard() -> Result<Value, ErrorRecord> {
    panic!("fixture module panicked")
}

fn print_lines(lines: u64) -> Result<Value, ErrorRecord> {
    let mut out = BufWriter::new(std::io::stdout().lock());
    for line in 0..lines {
        writeln!(out, "fixture output line {line}")
            .map_err(|err| ErrorRecord::new("Error", err.to_string()))?;
    }
    out.flush()
        .map_err(|err| ErrorRecord::new("Error", err.to_string()))?;
    Ok(Value::from(lines))
}

fn fixture_module() -> Module {
    Module::new()
        .method("echo", |args: Vec<Value>| async move {
            Ok(args.into_iter().next().unwrap_or(Value::Nil))
        })
        .method("add", |args: Vec<Value>| async move {
            let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
            Ok(Value::from(sum))
        })
        .method("pid", |_| async { Ok(Value::from(std::process::id())) })
        .method("sleep", |args: Vec<Value>| async move {
            let ms = first_u64(&args);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(Value::from(ms))
        })
        .method("hang", |_| async { block_forever() })
        .method("crash", |args: Vec<Value>| async move {
            exit_now(i32::try_from(first_u64(&args)).unwrap_or(1))
        })
        .method("panic", |_| async { fail_hard() })
        .method("chatty", |args: Vec<Value>| async move { print_lines(first_u64(&args)) })
        .method("typeError", |args: Vec<Value>| async move {
            Err(ErrorRecord::type_error(first_str(&args)))
        })
        .method("customError", |args: Vec<Value>| async move {
            Err(ErrorRecord::new("ValidationError", first_str(&args))
                .with_field("code", "E_FIXTURE")
                .with_field("retryable", false)
                .with_field("attempts", 3))
        })
        .callable(|args: Vec<Value>| async move { Ok(Value::from(args.len() as u64)) })
        .on_init(|| async {
            println!("fixture worker {} initialized", std::process::id());
            Ok(())
        })
        .on_diagnostic(|diagnostic| info!(?diagnostic, "fixture diagnostic requested"))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    observability::init(ObservabilityOptions {
        default_filter: Some("worker_nodes=warn".to_string()),
        ..ObservabilityOptions::default()
    });

    let registry = ModuleRegistry::new().register("fixture", fixture_module);
    let code = run_process_worker(registry).await?;
    observability::flush();
    std::process::exit(code)
}

//! Logging setup shared by pool hosts and worker binaries.
//!
//! Everything is written to stderr so a worker's stdout stays with its
//! module.

#[cfg(feature = "trace")]
use std::sync::{Mutex, OnceLock};

#[cfg(feature = "trace")]
use tracing_chrome::FlushGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "worker_nodes=info";

#[derive(Clone, Debug, Default)]
pub struct ObservabilityOptions {
    /// Filter used when `RUST_LOG` is unset. Defaults to `worker_nodes=info`.
    pub default_filter: Option<String>,
    /// Write a chrome trace here. Needs the `trace` feature.
    pub trace_path: Option<String>,
}

#[cfg(feature = "trace")]
static TRACE_GUARD: OnceLock<Mutex<Option<FlushGuard>>> = OnceLock::new();

#[cfg(feature = "trace")]
fn store_trace_guard(guard: Option<FlushGuard>) {
    let cell = TRACE_GUARD.get_or_init(|| Mutex::new(None));
    let mut slot = cell.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    *slot = guard;
}

/// Flush and close the chrome trace, if one is being written.
#[cfg(feature = "trace")]
pub fn flush() {
    if let Some(cell) = TRACE_GUARD.get() {
        let mut slot = cell.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.take();
    }
}

#[cfg(not(feature = "trace"))]
pub fn flush() {}

/// Install the global subscriber. Later calls are no-ops.
pub fn init(options: ObservabilityOptions) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(options.default_filter.as_deref().unwrap_or(DEFAULT_FILTER))
    });
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);

    #[cfg(feature = "trace")]
    let (chrome_layer, trace_guard) = match options.trace_path.clone() {
        Some(path) => {
            let (layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
                .file(path.clone())
                .include_args(true)
                .build();
            eprintln!("tracing-chrome enabled (trace at {path})");
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    #[cfg(not(feature = "trace"))]
    if let Some(path) = &options.trace_path {
        eprintln!("chrome trace {path} not written. Rebuild with --features trace to enable it.");
    }

    let registry = tracing_subscriber::registry().with(filter).with(fmt_layer);
    #[cfg(feature = "trace")]
    let registry = registry.with(chrome_layer);

    if registry.try_init().is_err() {
        return;
    }
    #[cfg(feature = "trace")]
    store_trace_guard(trace_guard);
}

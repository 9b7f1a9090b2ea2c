//! Worker-side runtime: the module a worker serves and the loop that serves it.
//!
//! A [`Module`] is a table of async method callables. Thread workers look
//! modules up in a [`ModuleRegistry`] handed to the pool; process workers
//! build their own registry in a small binary that calls
//! [`run_process_worker`].
//!
//! Each worker loads its own fresh [`Module`], so state captured by a loader
//! is never shared between workers.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    net::SocketAddr,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result as AnyResult};
use clap::Parser;
use futures::{FutureExt, StreamExt, future::BoxFuture, stream::FuturesUnordered};
use rmpv::Value;
use tokio::{
    net::TcpStream,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
};
use tracing::{debug, error, info, warn};

use crate::{
    messages::{
        BridgeHello, ControlMessage, ErrorRecord, MODULE_EXPORT, PoolFrame, Request, Response,
        WorkerCommand, WorkerFrame,
    },
    options::ResourceLimits,
    transport::{DEFAULT_MAX_MESSAGE_SIZE, FrameReader, FrameWriter},
};

pub const EXIT_OK: i32 = 0;
pub const EXIT_LOAD_FAILURE: i32 = 1;
pub const EXIT_PANIC: i32 = 101;

/// Async callable bound to a method name.
pub type MethodCallable =
    Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, ErrorRecord>> + Send + Sync>;

type InitCallable = Arc<dyn Fn() -> BoxFuture<'static, Result<(), ErrorRecord>> + Send + Sync>;
type DiagnosticHook = Arc<dyn Fn(Diagnostic) + Send + Sync>;
type ModuleLoader = Arc<dyn Fn() -> Module + Send + Sync>;

/// Diagnostic requests forwarded from the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnostic {
    Profile { duration: Duration },
    HeapSnapshot,
}

#[derive(Clone, Default)]
pub struct Module {
    methods: HashMap<String, MethodCallable>,
    export: Option<MethodCallable>,
    init: Option<InitCallable>,
    diagnostics: Option<DiagnosticHook>,
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<&String> = self.methods.keys().collect();
        methods.sort();
        f.debug_struct("Module")
            .field("methods", &methods)
            .field("callable", &self.export.is_some())
            .field("init", &self.init.is_some())
            .finish()
    }
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named method.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ErrorRecord>> + Send + 'static,
    {
        self.methods.insert(name.into(), boxed_callable(handler));
        self
    }

    /// Make the module itself callable.
    pub fn callable<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ErrorRecord>> + Send + 'static,
    {
        self.export = Some(boxed_callable(handler));
        self
    }

    /// Run `init` once after the module is loaded in a worker.
    pub fn on_init<F, Fut>(mut self, init: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ErrorRecord>> + Send + 'static,
    {
        self.init = Some(Arc::new(move || init().boxed()));
        self
    }

    pub fn on_diagnostic<F>(mut self, hook: F) -> Self
    where
        F: Fn(Diagnostic) + Send + Sync + 'static,
    {
        self.diagnostics = Some(Arc::new(hook));
        self
    }

    pub fn resolve(&self, method: &str) -> Option<MethodCallable> {
        if method == MODULE_EXPORT {
            return self.export.clone();
        }
        self.methods.get(method).cloned()
    }

    async fn initialize(&self) -> Result<(), ErrorRecord> {
        match &self.init {
            Some(init) => init().await,
            None => Ok(()),
        }
    }

    fn diagnose(&self, diagnostic: Diagnostic) {
        match &self.diagnostics {
            Some(hook) => hook(diagnostic),
            None => info!(?diagnostic, "module does not handle diagnostics"),
        }
    }
}

fn boxed_callable<F, Fut>(handler: F) -> MethodCallable
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ErrorRecord>> + Send + 'static,
{
    Arc::new(move |args| handler(args).boxed())
}

/// Named module loaders.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    loaders: HashMap<String, ModuleLoader>,
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.paths()).finish()
    }
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, path: impl Into<String>, loader: F) -> Self
    where
        F: Fn() -> Module + Send + Sync + 'static,
    {
        self.loaders.insert(path.into(), Arc::new(loader));
        self
    }

    pub fn contains(&self, path: &str) -> bool {
        self.loaders.contains_key(path)
    }

    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.loaders.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }

    pub fn load(&self, path: &str) -> Option<Module> {
        self.loaders.get(path).map(|loader| loader())
    }
}

struct LoadedModule {
    path: String,
    module: Module,
}

/// Serve one worker until it is told to exit or its channels close.
///
/// Returns the worker's exit code.
pub(crate) async fn serve(
    worker_id: u64,
    registry: ModuleRegistry,
    mut incoming: UnboundedReceiver<PoolFrame>,
    outgoing: UnboundedSender<WorkerFrame>,
) -> i32 {
    let mut loaded: Option<Arc<LoadedModule>> = None;
    let mut deferred: Vec<WorkerCommand> = Vec::new();
    let mut calls: FuturesUnordered<BoxFuture<'static, Response>> = FuturesUnordered::new();

    loop {
        tokio::select! {
            Some(response) = calls.next(), if !calls.is_empty() => {
                if outgoing.send(WorkerFrame::Response(response)).is_err() {
                    debug!(worker_id, "response channel closed");
                    return EXIT_OK;
                }
            }
            message = incoming.recv() => {
                let Some(message) = message else {
                    debug!(worker_id, "worker channels closed");
                    return EXIT_OK;
                };
                match message {
                    PoolFrame::Control(ControlMessage::Start {
                        module_path,
                        async_worker_initialization,
                    }) => {
                        if loaded.is_some() {
                            warn!(worker_id, "ignoring duplicate start message");
                            continue;
                        }
                        let Some(module) = registry.load(&module_path) else {
                            error!(worker_id, module_path = %module_path, "module is not registered");
                            return EXIT_LOAD_FAILURE;
                        };

                        if async_worker_initialization {
                            if let Err(err) = module.initialize().await {
                                error!(worker_id, ?err, "module initialization failed");
                                return EXIT_LOAD_FAILURE;
                            }
                            let _ = outgoing.send(WorkerFrame::Ready);
                        } else {
                            let _ = outgoing.send(WorkerFrame::Ready);
                            if let Err(err) = module.initialize().await {
                                error!(worker_id, ?err, "module initialization failed");
                                return EXIT_LOAD_FAILURE;
                            }
                        }
                        debug!(worker_id, module_path = %module_path, "module loaded");

                        let current = Arc::new(LoadedModule {
                            path: module_path,
                            module,
                        });
                        for command in deferred.drain(..) {
                            execute(worker_id, &current, command, &mut calls);
                        }
                        loaded = Some(current);
                    }
                    PoolFrame::Control(ControlMessage::Exit) => {
                        debug!(worker_id, in_flight = calls.len(), "exit requested");
                        return EXIT_OK;
                    }
                    PoolFrame::Command(command) => match &loaded {
                        Some(current) => execute(worker_id, current, command, &mut calls),
                        None => deferred.push(command),
                    },
                }
            }
        }
    }
}

fn execute(
    worker_id: u64,
    loaded: &Arc<LoadedModule>,
    command: WorkerCommand,
    calls: &mut FuturesUnordered<BoxFuture<'static, Response>>,
) {
    match command {
        WorkerCommand::Call(request) => calls.push(invoke(worker_id, Arc::clone(loaded), request)),
        WorkerCommand::Profiler { duration_ms } => loaded.module.diagnose(Diagnostic::Profile {
            duration: Duration::from_millis(duration_ms),
        }),
        WorkerCommand::TakeSnapshot => loaded.module.diagnose(Diagnostic::HeapSnapshot),
    }
}

fn invoke(worker_id: u64, loaded: Arc<LoadedModule>, request: Request) -> BoxFuture<'static, Response> {
    async move {
        let Request {
            call_id,
            method,
            args,
            ..
        } = request;
        let outcome = match loaded.module.resolve(&method) {
            Some(callable) => callable(args).await,
            None => Err(ErrorRecord::type_error(format!("{method} is not a function"))),
        };
        let outcome = outcome.map_err(|record| with_stack(record, &loaded.path, &method, worker_id));
        Response::from_outcome(call_id, worker_id, outcome)
    }
    .boxed()
}

/// Fill in a stack trace pointing at the failing method when the module left
/// none.
fn with_stack(record: ErrorRecord, module_path: &str, method: &str, worker_id: u64) -> ErrorRecord {
    if record.stack().is_some() {
        return record;
    }
    let stack = format!(
        "{}: {}\n    at {module_path}::{method} (worker {worker_id})",
        record.type_name().unwrap_or("Error"),
        record.message().unwrap_or_default(),
    );
    record.with_stack(stack)
}

/// Body of a thread worker. Panics inside module code end the worker with
/// [`EXIT_PANIC`].
pub(crate) fn run_thread_worker(
    worker_id: u64,
    registry: ModuleRegistry,
    limits: Option<ResourceLimits>,
    incoming: UnboundedReceiver<PoolFrame>,
    outgoing: UnboundedSender<WorkerFrame>,
) -> i32 {
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(move || {
        let mut builder = tokio::runtime::Builder::new_current_thread();
        builder.enable_all();
        if let Some(max) = limits.and_then(|limits| limits.max_blocking_threads)
            && max > 0
        {
            builder.max_blocking_threads(max);
        }
        match builder.build() {
            Ok(runtime) => runtime.block_on(serve(worker_id, registry, incoming, outgoing)),
            Err(err) => {
                error!(worker_id, ?err, "failed to build worker runtime");
                EXIT_LOAD_FAILURE
            }
        }
    }));
    outcome.unwrap_or_else(|_| {
        error!(worker_id, "worker thread panicked");
        EXIT_PANIC
    })
}

/// Command line every process worker is launched with.
#[derive(Debug, Clone, Parser)]
#[command(about = "Serve a worker-nodes module")]
pub struct WorkerArgs {
    /// Address of the pool's worker bridge.
    #[arg(long)]
    pub bridge: SocketAddr,
    /// Id reserved for this worker by the pool.
    #[arg(long)]
    pub worker_id: u64,
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_SIZE)]
    pub max_message_size: usize,
}

/// Entry point for process worker binaries: parse [`WorkerArgs`] from the
/// command line and serve `registry`. Returns the exit code to terminate with.
pub async fn run_process_worker(registry: ModuleRegistry) -> AnyResult<i32> {
    serve_process(WorkerArgs::parse(), registry).await
}

/// Serve `registry` as a process worker over a socket connected to the
/// pool's bridge. Stdio is left to the module.
///
/// A panic in module code ends the worker with [`EXIT_PANIC`] so the pool
/// sees the exit and can retry the call elsewhere.
pub async fn serve_process(args: WorkerArgs, registry: ModuleRegistry) -> AnyResult<i32> {
    let WorkerArgs {
        bridge,
        worker_id,
        max_message_size,
    } = args;

    let stream = TcpStream::connect(bridge)
        .await
        .with_context(|| format!("failed to connect to worker bridge at {bridge}"))?;
    stream.set_nodelay(true).context("failed to set TCP_NODELAY")?;
    let (read_half, write_half) = stream.into_split();

    let mut bridge_writer = FrameWriter::new(write_half);
    bridge_writer
        .send(&BridgeHello { worker_id })
        .await
        .context("failed to send bridge hello")?;
    debug!(worker_id, %bridge, "attached to worker bridge");

    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<WorkerFrame>();

    tokio::spawn(async move {
        let mut reader = FrameReader::new(read_half, max_message_size);
        loop {
            match reader.next_message::<PoolFrame>().await {
                Ok(Some(frame)) => {
                    if incoming_tx.send(frame).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(worker_id, ?err, "bridge read failed");
                    break;
                }
            }
        }
    });

    let writer = tokio::spawn(async move {
        while let Some(frame) = outgoing_rx.recv().await {
            if let Err(err) = bridge_writer.send(&frame).await {
                warn!(worker_id, ?err, "failed to write to pool");
                break;
            }
        }
    });

    let outcome = AssertUnwindSafe(serve(worker_id, registry, incoming_rx, outgoing_tx))
        .catch_unwind()
        .await;
    match outcome {
        Ok(code) => {
            if let Err(err) = writer.await {
                warn!(worker_id, ?err, "worker writer task failed");
            }
            Ok(code)
        }
        Err(_) => {
            error!(worker_id, "module panicked, exiting worker");
            writer.abort();
            Ok(EXIT_PANIC)
        }
    }
}

//! The execution context behind a worker: a child process or an OS thread.
//!
//! ## Process workers
//!
//! ```text
//!   pool ── bridge TCP (PoolFrame)   ──▶ child
//!   pool ◀─ bridge TCP (WorkerFrame) ─── child
//!   stdin / stdout / stderr are inherited and belong to the module
//! ```
//!
//! ## Thread workers
//!
//! The same frames travel over one inbound and one outbound in-memory
//! channel.
//!
//! Either way a supervisor task forwards readiness and responses to the pool
//! in order and reports the exit exactly once, after every response the
//! worker produced has been forwarded.

use std::{path::Path, process::Stdio, sync::Arc, time::Duration};

use anyhow::{Context, Result as AnyResult};
use chrono::{DateTime, Utc};
use tokio::{
    process::{Child, Command},
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    time::timeout,
};
use tracing::{debug, info, trace, warn};

use super::{WorkerEvent, WorkerHandle};
use crate::{
    bridge::{WorkerBridgeChannels, WorkerBridgeServer},
    errors::PoolError,
    messages::{ControlMessage, PoolFrame, WorkerCommand, WorkerFrame},
    options::{WorkerOptions, WorkerType},
    runtime,
};

/// How long a process worker may take to attach to the bridge.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// How long to keep forwarding buffered responses after a worker exited.
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) struct WorkerProcess {
    worker_id: u64,
    inbound: UnboundedSender<PoolFrame>,
    kill_switch: UnboundedSender<()>,
    stop_timeout: Duration,
    handle: WorkerHandle,
    start_date: Option<DateTime<Utc>>,
    exit_requested: bool,
}

impl WorkerProcess {
    /// Launch the worker and send it the start message.
    pub(crate) fn spawn(
        worker_id: u64,
        options: &WorkerOptions,
        bridge: Option<&Arc<WorkerBridgeServer>>,
        events: UnboundedSender<WorkerEvent>,
    ) -> Result<Self, PoolError> {
        let spawned = match (options.worker_type, bridge) {
            (WorkerType::Process, Some(bridge)) => {
                Self::spawn_process(worker_id, options, bridge, events)
            }
            (WorkerType::Process, None) => {
                return Err(PoolError::Spawn(
                    "process workers require a worker bridge".into(),
                ));
            }
            (WorkerType::Thread, _) => Self::spawn_thread(worker_id, options, events),
        };
        spawned.map_err(|err| PoolError::Spawn(format!("{err:#}")))
    }

    fn spawn_process(
        worker_id: u64,
        options: &WorkerOptions,
        bridge: &Arc<WorkerBridgeServer>,
        events: UnboundedSender<WorkerEvent>,
    ) -> AnyResult<Self> {
        let program = options
            .program
            .as_deref()
            .context("process workers require a worker program")?;

        let connection_rx = bridge.reserve_worker(worker_id);
        let child = match launch(program, options, bridge, worker_id) {
            Ok(child) => child,
            Err(err) => {
                bridge.cancel_worker(worker_id);
                return Err(err);
            }
        };
        let pid = child.id();
        info!(
            pid,
            program = %program.display(),
            worker_id,
            "spawned process worker"
        );

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();

        // Queued until the child attaches, so it always precedes any call.
        let _ = inbound_tx.send(start_frame(options));

        tokio::spawn(pump_frames(
            worker_id,
            connection_rx,
            inbound_rx,
            outbound_tx,
            kill_tx.clone(),
            Arc::clone(bridge),
        ));
        tokio::spawn(supervise_process(
            worker_id,
            child,
            outbound_rx,
            kill_rx,
            events,
            Arc::clone(bridge),
        ));

        Ok(Self {
            worker_id,
            inbound: inbound_tx,
            kill_switch: kill_tx,
            stop_timeout: options.stop_timeout,
            handle: WorkerHandle::Process { pid },
            start_date: None,
            exit_requested: false,
        })
    }

    fn spawn_thread(
        worker_id: u64,
        options: &WorkerOptions,
        events: UnboundedSender<WorkerEvent>,
    ) -> AnyResult<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();

        let name = format!("worker-nodes-{worker_id}");
        let mut builder = std::thread::Builder::new().name(name.clone());
        if let Some(stack_size_mb) = options
            .resource_limits
            .and_then(|limits| limits.stack_size_mb)
        {
            builder = builder.stack_size(stack_size_mb * 1024 * 1024);
        }

        let registry = options.modules.clone();
        let limits = options.resource_limits;
        builder
            .spawn(move || {
                let code =
                    runtime::run_thread_worker(worker_id, registry, limits, inbound_rx, outbound_tx);
                let _ = exit_tx.send(code);
            })
            .context("failed to spawn worker thread")?;
        info!(worker_id, thread = %name, "spawned thread worker");

        let _ = inbound_tx.send(start_frame(options));

        tokio::spawn(supervise_thread(
            worker_id,
            outbound_rx,
            exit_rx,
            kill_rx,
            events,
        ));

        Ok(Self {
            worker_id,
            inbound: inbound_tx,
            kill_switch: kill_tx,
            stop_timeout: options.stop_timeout,
            handle: WorkerHandle::Thread {
                name,
                resource_limits: options.resource_limits,
            },
            start_date: None,
            exit_requested: false,
        })
    }

    /// Queue a command for the worker. Returns false if the worker is gone.
    pub(crate) fn send(&self, command: WorkerCommand) -> bool {
        self.inbound.send(PoolFrame::Command(command)).is_ok()
    }

    /// Ask the worker to exit, and force it after the stop timeout.
    pub(crate) fn exit(&mut self) {
        if self.exit_requested {
            return;
        }
        self.exit_requested = true;

        let sent = self
            .inbound
            .send(PoolFrame::Control(ControlMessage::Exit))
            .is_ok();
        debug!(worker_id = self.worker_id, sent, "requested worker exit");

        let kill_switch = self.kill_switch.clone();
        let grace = self.stop_timeout;
        let worker_id = self.worker_id;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if kill_switch.send(()).is_ok() {
                debug!(worker_id, "worker still running after stop timeout");
            }
        });
    }

    pub(crate) fn mark_ready(&mut self) {
        self.start_date = Some(Utc::now());
    }

    pub(crate) fn start_date(&self) -> Option<DateTime<Utc>> {
        self.start_date
    }

    pub(crate) fn handle(&self) -> &WorkerHandle {
        &self.handle
    }
}

fn start_frame(options: &WorkerOptions) -> PoolFrame {
    PoolFrame::Control(ControlMessage::Start {
        module_path: options.module_path.clone(),
        async_worker_initialization: options.async_initialization,
    })
}

fn launch(
    program: &Path,
    options: &WorkerOptions,
    bridge: &WorkerBridgeServer,
    worker_id: u64,
) -> AnyResult<Child> {
    let mut command = Command::new(program);
    command.args(&options.program_args);
    command
        .arg("--bridge")
        .arg(bridge.addr().to_string())
        .arg("--worker-id")
        .arg(worker_id.to_string())
        .arg("--max-message-size")
        .arg(options.max_message_size.to_string());
    command
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    command
        .spawn()
        .with_context(|| format!("failed to launch worker program {}", program.display()))
}

async fn pump_frames(
    worker_id: u64,
    connection_rx: oneshot::Receiver<WorkerBridgeChannels>,
    mut inbound: UnboundedReceiver<PoolFrame>,
    outbound: UnboundedSender<WorkerFrame>,
    kill_switch: UnboundedSender<()>,
    bridge: Arc<WorkerBridgeServer>,
) {
    let channels = match timeout(CONNECT_TIMEOUT, connection_rx).await {
        Ok(Ok(channels)) => channels,
        Ok(Err(_)) => {
            debug!(worker_id, "worker exited before attaching to the bridge");
            return;
        }
        Err(_) => {
            bridge.cancel_worker(worker_id);
            warn!(
                worker_id,
                timeout_secs = CONNECT_TIMEOUT.as_secs(),
                "timed out waiting for worker to connect"
            );
            let _ = kill_switch.send(());
            return;
        }
    };
    drop(kill_switch);
    debug!(worker_id, "worker attached to the bridge");

    let WorkerBridgeChannels {
        mut reader,
        mut writer,
    } = channels;
    tokio::spawn(async move {
        loop {
            match reader.next_message::<WorkerFrame>().await {
                Ok(Some(frame)) => {
                    if outbound.send(frame).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    trace!(worker_id, "worker bridge connection closed");
                    break;
                }
                Err(err) => {
                    warn!(worker_id, ?err, "worker bridge read failed");
                    break;
                }
            }
        }
    });

    while let Some(frame) = inbound.recv().await {
        if let Err(err) = writer.send(&frame).await {
            warn!(worker_id, ?err, "failed to send frame to worker");
            break;
        }
    }
}

/// Forwards worker output to the pool; only the first readiness counts.
struct Forwarder {
    worker_id: u64,
    events: UnboundedSender<WorkerEvent>,
    ready: bool,
}

impl Forwarder {
    fn new(worker_id: u64, events: UnboundedSender<WorkerEvent>) -> Self {
        Self {
            worker_id,
            events,
            ready: false,
        }
    }

    fn forward(&mut self, message: WorkerFrame) {
        let worker_id = self.worker_id;
        let event = match message {
            WorkerFrame::Ready if self.ready => {
                trace!(worker_id, "ignoring repeated readiness");
                return;
            }
            WorkerFrame::Ready => {
                self.ready = true;
                debug!(worker_id, "worker ready");
                WorkerEvent::Ready { worker_id }
            }
            WorkerFrame::Response(response) => WorkerEvent::Response {
                worker_id,
                response,
            },
        };
        let _ = self.events.send(event);
    }

    fn exit(self, code: Option<i32>) {
        let _ = self.events.send(WorkerEvent::Exit {
            worker_id: self.worker_id,
            code,
        });
    }
}

async fn supervise_process(
    worker_id: u64,
    mut child: Child,
    mut outbound: UnboundedReceiver<WorkerFrame>,
    mut kill_switch: UnboundedReceiver<()>,
    events: UnboundedSender<WorkerEvent>,
    bridge: Arc<WorkerBridgeServer>,
) {
    let mut forwarder = Forwarder::new(worker_id, events);
    let status = loop {
        tokio::select! {
            biased;
            Some(message) = outbound.recv() => forwarder.forward(message),
            status = child.wait() => break status,
            _ = kill_switch.recv() => {
                info!(worker_id, pid = child.id(), "killing worker process");
                if let Err(err) = child.start_kill() {
                    warn!(worker_id, ?err, "failed to kill worker process");
                }
                break child.wait().await;
            }
        }
    };
    bridge.cancel_worker(worker_id);

    while let Ok(Some(message)) = timeout(EXIT_DRAIN_TIMEOUT, outbound.recv()).await {
        forwarder.forward(message);
    }

    let code = match status {
        Ok(status) => status.code(),
        Err(err) => {
            warn!(worker_id, ?err, "failed to wait for worker process");
            None
        }
    };
    info!(worker_id, ?code, "worker process exited");
    forwarder.exit(code);
}

async fn supervise_thread(
    worker_id: u64,
    mut outbound: UnboundedReceiver<WorkerFrame>,
    exit_rx: oneshot::Receiver<i32>,
    mut kill_switch: UnboundedReceiver<()>,
    events: UnboundedSender<WorkerEvent>,
) {
    let mut forwarder = Forwarder::new(worker_id, events);
    let code = loop {
        tokio::select! {
            biased;
            message = outbound.recv() => match message {
                Some(message) => forwarder.forward(message),
                // The runtime dropped its sender, so the thread is finishing.
                None => break exit_rx.await.ok(),
            },
            _ = kill_switch.recv() => {
                warn!(worker_id, "worker thread did not stop in time, detaching it");
                break None;
            }
        }
    };
    info!(worker_id, ?code, "worker thread exited");
    forwarder.exit(code);
}

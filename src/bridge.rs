//! TCP bridge that process workers attach their call channel to.
//!
//! The protocol works as follows:
//!
//! 1. The pool reserves a worker id, then spawns the child with
//!    `--bridge <addr> --worker-id <id>`
//! 2. The child connects and sends a [`BridgeHello`] frame carrying its id
//! 3. The bridge matches the connection to the reservation and hands the
//!    framed reader/writer pair to whoever is waiting on it
//! 4. Calls and responses flow over that connection until either side closes

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};

use anyhow::{Context, Result as AnyResult};
use tokio::{
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::oneshot,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    messages::BridgeHello,
    transport::{FrameReader, FrameWriter},
};

/// How long a freshly accepted connection may take to identify itself.
const HELLO_TIMEOUT: Duration = Duration::from_secs(15);

/// Framed halves of an attached worker connection.
pub struct WorkerBridgeChannels {
    pub reader: FrameReader<OwnedReadHalf>,
    pub writer: FrameWriter<OwnedWriteHalf>,
}

/// Workers are reserved before they connect, so we can correlate
/// the connection with the spawned process.
struct WorkerBridgeState {
    pending: StdMutex<HashMap<u64, oneshot::Sender<WorkerBridgeChannels>>>,
}

impl WorkerBridgeState {
    fn new() -> Self {
        Self {
            pending: StdMutex::new(HashMap::new()),
        }
    }

    fn reserve_worker(&self, worker_id: u64) -> oneshot::Receiver<WorkerBridgeChannels> {
        let (tx, rx) = oneshot::channel();
        let mut guard = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        guard.insert(worker_id, tx);
        rx
    }

    fn cancel_worker(&self, worker_id: u64) {
        let mut guard = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        guard.remove(&worker_id);
    }

    fn register_worker(&self, worker_id: u64, channels: WorkerBridgeChannels) -> bool {
        let sender = {
            let mut guard = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            guard.remove(&worker_id)
        };
        match sender {
            Some(waiter) => waiter.send(channels).is_ok(),
            None => false,
        }
    }
}

/// Listener for process worker call channels.
///
/// # Example
///
/// ```ignore
/// let bridge = WorkerBridgeServer::bind(None, DEFAULT_MAX_MESSAGE_SIZE)?;
/// let connection_rx = bridge.reserve_worker(worker_id);
/// // ... spawn worker process with worker_id ...
/// let channels = connection_rx.await?; // Wait for worker to connect
/// ```
pub struct WorkerBridgeServer {
    addr: SocketAddr,
    state: Arc<WorkerBridgeState>,
    shutdown_tx: StdMutex<Option<oneshot::Sender<()>>>,
}

impl WorkerBridgeServer {
    /// Bind the bridge and start accepting connections.
    ///
    /// If `bind_addr` is None, binds to localhost on an ephemeral port.
    /// Must be called from within a tokio runtime.
    pub fn bind(bind_addr: Option<SocketAddr>, max_message_size: usize) -> AnyResult<Arc<Self>> {
        let bind_addr =
            bind_addr.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0));

        let std_listener = std::net::TcpListener::bind(bind_addr)
            .context("failed to bind worker bridge listener")?;
        std_listener
            .set_nonblocking(true)
            .context("failed to make worker bridge listener non-blocking")?;
        let listener = TcpListener::from_std(std_listener)
            .context("failed to register worker bridge listener")?;
        let addr = listener
            .local_addr()
            .context("failed to resolve bridge addr")?;

        info!(%addr, "worker bridge listening");

        let state = Arc::new(WorkerBridgeState::new());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&state),
            shutdown_rx,
            max_message_size,
        ));

        Ok(Arc::new(Self {
            addr,
            state,
            shutdown_tx: StdMutex::new(Some(shutdown_tx)),
        }))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Reserve a slot for an incoming worker connection.
    /// Returns a receiver that will be signaled when the worker connects.
    pub fn reserve_worker(&self, worker_id: u64) -> oneshot::Receiver<WorkerBridgeChannels> {
        self.state.reserve_worker(worker_id)
    }

    /// Cancel a pending worker reservation (e.g., if spawn fails).
    pub fn cancel_worker(&self, worker_id: u64) {
        self.state.cancel_worker(worker_id);
    }

    /// Stop accepting new connections. Attached workers are unaffected.
    pub fn shutdown(&self) {
        let sender = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = sender {
            let _ = tx.send(());
            info!(addr = %self.addr, "worker bridge shut down");
        }
    }
}

impl Drop for WorkerBridgeServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<WorkerBridgeState>,
    mut shutdown_rx: oneshot::Receiver<()>,
    max_message_size: usize,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(attach(stream, peer, Arc::clone(&state), max_message_size));
                }
                Err(err) => warn!(?err, "worker bridge accept failed"),
            },
        }
    }
}

async fn attach(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<WorkerBridgeState>,
    max_message_size: usize,
) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(?err, %peer, "failed to set TCP_NODELAY on worker connection");
    }
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half, max_message_size);

    let hello = match timeout(HELLO_TIMEOUT, reader.next_message::<BridgeHello>()).await {
        Ok(Ok(Some(hello))) => hello,
        Ok(Ok(None)) => {
            debug!(%peer, "worker connection closed before hello");
            return;
        }
        Ok(Err(err)) => {
            warn!(?err, %peer, "invalid worker hello");
            return;
        }
        Err(_) => {
            warn!(%peer, "worker did not send hello in time");
            return;
        }
    };

    let worker_id = hello.worker_id;
    let channels = WorkerBridgeChannels {
        reader,
        writer: FrameWriter::new(write_half),
    };
    if state.register_worker(worker_id, channels) {
        debug!(worker_id, %peer, "worker attached to bridge");
    } else {
        warn!(worker_id, %peer, "connection for unknown or abandoned worker id dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{messages::Response, transport::DEFAULT_MAX_MESSAGE_SIZE};

    #[tokio::test]
    async fn reserved_worker_receives_its_connection() {
        let bridge = WorkerBridgeServer::bind(None, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        let connection_rx = bridge.reserve_worker(42);

        let stream = TcpStream::connect(bridge.addr()).await.unwrap();
        let (client_read, client_write) = stream.into_split();
        let mut client_writer = FrameWriter::new(client_write);
        client_writer
            .send(&BridgeHello { worker_id: 42 })
            .await
            .unwrap();

        let mut channels = timeout(Duration::from_secs(5), connection_rx)
            .await
            .unwrap()
            .unwrap();

        channels
            .writer
            .send(&Response::success(1, 42, rmpv::Value::from("pong")))
            .await
            .unwrap();
        let mut client_reader = FrameReader::new(client_read, DEFAULT_MAX_MESSAGE_SIZE);
        let response: Response = client_reader.next_message().await.unwrap().unwrap();
        assert_eq!(response.worker_id, 42);
    }

    #[tokio::test]
    async fn cancelled_reservation_is_not_completed() {
        let bridge = WorkerBridgeServer::bind(None, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        let connection_rx = bridge.reserve_worker(7);
        bridge.cancel_worker(7);
        assert!(connection_rx.await.is_err());
    }

    #[tokio::test]
    async fn unknown_worker_connection_is_dropped() {
        let bridge = WorkerBridgeServer::bind(None, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        let stream = TcpStream::connect(bridge.addr()).await.unwrap();
        let (client_read, client_write) = stream.into_split();
        FrameWriter::new(client_write)
            .send(&BridgeHello { worker_id: 999 })
            .await
            .unwrap();

        let mut client_reader = FrameReader::new(client_read, DEFAULT_MAX_MESSAGE_SIZE);
        let next = timeout(
            Duration::from_secs(5),
            client_reader.next_message::<Response>(),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(next.is_none());
    }
}

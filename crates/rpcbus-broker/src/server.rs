//! TCP server: accept loop and per-connection task pair.

use crate::queue::{delivery_queue, DeliveryReceiver};
use crate::registry::{ConnId, NodeRegistry};
use crate::router::{Router, RouterVerdict};
use crate::BrokerError;
use rpcbus_proto::MAX_MESSAGE_SIZE;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// First connection id handed out.
const FIRST_CONN_ID: ConnId = 100;

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address to bind the listener on. Port 0 binds an ephemeral port;
    /// read it back with [`Broker::local_addr`].
    pub listen_addr: SocketAddr,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:5000".parse().expect("valid default address"),
        }
    }
}

/// The running daemon: listener plus one connection pair per node.
pub struct Broker {
    router: Router,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Broker {
    /// Bind the listener and start accepting nodes.
    pub async fn start(config: BrokerConfig) -> Result<Arc<Self>, BrokerError> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "broker listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let router = Router::new(NodeRegistry::new());

        let broker = Arc::new(Self {
            router: router.clone(),
            local_addr,
            shutdown_tx,
            accept_task: Mutex::new(None),
        });
        let handle = tokio::spawn(accept_loop(listener, router, shutdown_rx));
        *broker.accept_task.lock().await = Some(handle);
        Ok(broker)
    }

    /// Actual bound address (useful when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &NodeRegistry {
        self.router.registry()
    }

    /// Cooperative shutdown: every loop observes the flag, then all
    /// remaining nodes are destroyed.
    pub async fn shutdown(&self) {
        info!("broker shutting down");
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.accept_task.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }

        let registry = self.router.registry();
        registry.dump();
        for entry in registry.drain() {
            if let Some(tx) = entry.tx_task {
                tx.abort();
            }
            if let Some(rx) = entry.rx_task {
                rx.abort();
            }
        }
    }
}

/// Wait for connections; one registry entry and task pair per client.
async fn accept_loop(listener: TcpListener, router: Router, mut shutdown: watch::Receiver<bool>) {
    let mut next_conn_id = FIRST_CONN_ID;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let conn_id = next_conn_id;
                    next_conn_id += 1;
                    info!(conn_id, %addr, "client connected");
                    spawn_connection(conn_id, stream, router.clone(), shutdown.clone());
                }
                Err(err) => {
                    // Per-connection failure; the daemon keeps running.
                    error!(%err, "accept error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
    debug!("accept loop ended");
}

fn spawn_connection(
    conn_id: ConnId,
    stream: TcpStream,
    router: Router,
    shutdown: watch::Receiver<bool>,
) {
    let (reader, writer) = stream.into_split();
    let (queue, delivery_rx) = delivery_queue();
    router.registry().insert(conn_id, queue);

    let rx_task = tokio::spawn(receive_loop(conn_id, reader, router.clone(), shutdown.clone()));
    let tx_task = tokio::spawn(transmit_loop(conn_id, writer, delivery_rx, shutdown));
    router.registry().set_tasks(conn_id, rx_task, tx_task);
}

/// Read one envelope per read and hand it to the router synchronously: the
/// router call, including any queue put, completes before the next read.
async fn receive_loop(
    conn_id: ConnId,
    mut reader: OwnedReadHalf,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(conn_id, "receive task started");
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    router.disconnect(conn_id);
                    break;
                }
                Ok(n) => {
                    if router.process(conn_id, &buf[..n]) == RouterVerdict::Disconnect {
                        break;
                    }
                }
                Err(err) => {
                    // Transient errors retry the wait; only exit or hangup
                    // tears the connection down.
                    warn!(conn_id, %err, "read error, retrying");
                    continue;
                }
            }
        }
    }
    debug!(conn_id, "receive task ended");
}

/// Drain this node's delivery queue onto the socket.
async fn transmit_loop(
    conn_id: ConnId,
    mut writer: OwnedWriteHalf,
    mut queue: DeliveryReceiver,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(conn_id, "transmit task started");
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            item = queue.recv() => match item {
                Some(buf) => {
                    if let Err(err) = writer.write_all(&buf).await {
                        warn!(conn_id, %err, "send failed");
                        break;
                    }
                }
                None => break,
            }
        }
    }
    debug!(conn_id, "transmit task ended");
}

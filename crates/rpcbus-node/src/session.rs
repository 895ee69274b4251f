//! The client session: one TCP connection to the daemon plus the receive
//! task that keeps the synchronous call illusion alive.
//!
//! Outbound calls take the session's call lock, park a oneshot waiter in
//! the single pending slot and block on it with a timeout. The receive
//! task completes the waiter when a `return` (or a synthetic failure)
//! arrives. Inbound calls are dispatched inline on the receive task: the
//! handler runs and its reply is written back before the next envelope is
//! read, so a peer that calls us while waiting on its own call always
//! makes progress.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use rpcbus_proto::{
    Api, ArgFormat, Envelope, ProtoError, RetFormat, Value, ValueKind, MAX_MESSAGE_SIZE,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ClientError;
use crate::handler::{Args, Interface};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Off = 0,
    Connecting = 1,
    Connected = 2,
    Initialised = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SessionState::Connecting,
            2 => SessionState::Connected,
            3 => SessionState::Initialised,
            _ => SessionState::Off,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub daemon_addr: SocketAddr,
    /// How long a call waits for its return before giving up.
    pub call_timeout: Duration,
    /// How long to wait for the receive task to come up at connect time.
    pub ready_timeout: Duration,
    /// How long shutdown waits for the daemon to close the socket after
    /// the exit envelope before aborting the receive task.
    pub exit_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            daemon_addr: "127.0.0.1:5000".parse().expect("valid default address"),
            call_timeout: Duration::from_secs(5),
            ready_timeout: Duration::from_secs(1),
            exit_grace: Duration::from_millis(100),
        }
    }
}

type CallWaiter = oneshot::Sender<Result<Value, ClientError>>;

/// State shared between the session handle and its receive task.
#[derive(Debug)]
struct Shared {
    state: AtomicU8,
    node_name: RwLock<String>,
    interfaces: RwLock<HashMap<String, Interface>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// The single in-flight call. The call lock on [`ClientSession`]
    /// guarantees at most one occupant.
    pending: StdMutex<Option<CallWaiter>>,
}

impl Shared {
    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn node_name(&self) -> String {
        self.node_name
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn send(&self, env: &Envelope) -> Result<(), ClientError> {
        let bytes = env.encode()?;
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ClientError::NotInitialized)?;
        writer.write_all(&bytes).await?;
        Ok(())
    }

    fn take_waiter(&self) -> Option<CallWaiter> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    fn park_waiter(&self, tx: CallWaiter) {
        *self.pending.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
    }

    /// Hand an outcome to the in-flight call, if there is one.
    fn complete_call(&self, outcome: Result<Value, ClientError>) {
        match self.take_waiter() {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => warn!("return with no call in flight"),
        }
    }

    /// Drop the in-flight call with a failure, silently. Used on
    /// disconnect and shutdown where a missing waiter is normal.
    fn fail_call(&self) {
        if let Some(tx) = self.take_waiter() {
            let _ = tx.send(Err(ClientError::CallFailed));
        }
    }
}

/// A connection to the daemon. Owns the socket and the receive task;
/// cheap to share behind an [`Arc`].
#[derive(Debug)]
pub struct ClientSession {
    config: SessionConfig,
    shared: Arc<Shared>,
    /// Serializes outbound calls so the single pending slot never has two
    /// occupants.
    call_lock: Mutex<()>,
    rx_task: StdMutex<Option<JoinHandle<()>>>,
}

impl ClientSession {
    /// Connect to the daemon and start the receive task. The session is
    /// usable once this returns, but routes nothing to it until
    /// [`register`] runs.
    ///
    /// [`register`]: ClientSession::register
    pub async fn connect(config: SessionConfig) -> Result<Self, ClientError> {
        let shared = Arc::new(Shared {
            state: AtomicU8::new(SessionState::Connecting as u8),
            node_name: RwLock::new(String::new()),
            interfaces: RwLock::new(HashMap::new()),
            writer: Mutex::new(None),
            pending: StdMutex::new(None),
        });

        let stream = TcpStream::connect(config.daemon_addr)
            .await
            .map_err(|e| ClientError::ConnectFailed(e.to_string()))?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        *shared.writer.lock().await = Some(writer);
        shared.set_state(SessionState::Connected);

        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(receive_loop(Arc::clone(&shared), reader, ready_tx));

        if tokio::time::timeout(config.ready_timeout, ready_rx)
            .await
            .is_err()
        {
            task.abort();
            return Err(ClientError::ConnectFailed(
                "receive task did not come up".to_string(),
            ));
        }
        shared.set_state(SessionState::Initialised);
        debug!(addr = %config.daemon_addr, "session connected");

        Ok(Self {
            config,
            shared,
            call_lock: Mutex::new(()),
            rx_task: StdMutex::new(Some(task)),
        })
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Register this node under `name`, exporting `interfaces`. A second
    /// registration replaces the previous identity wholesale.
    pub async fn register(
        &self,
        name: &str,
        interfaces: Vec<Interface>,
    ) -> Result<(), ClientError> {
        self.ensure_ready()?;
        let descriptors: Vec<_> = interfaces
            .iter()
            .map(|iface| iface.descriptor().clone())
            .collect();
        // Fail locally before the daemon gets a chance to nack.
        for descriptor in &descriptors {
            descriptor.validate()?;
        }

        {
            let mut node_name = self
                .shared
                .node_name
                .write()
                .unwrap_or_else(|e| e.into_inner());
            *node_name = name.to_string();
        }
        {
            let mut map = self
                .shared
                .interfaces
                .write()
                .unwrap_or_else(|e| e.into_inner());
            map.clear();
            for iface in interfaces {
                map.insert(iface.descriptor().name.clone(), iface);
            }
        }

        info!(node = name, count = descriptors.len(), "registering");
        self.shared
            .send(&Envelope::register(name, descriptors))
            .await
    }

    /// Invoke `interface` on `dnode` and wait for the typed result.
    ///
    /// `args_fmt` declares the argument types and is checked against
    /// `args` before anything hits the wire; `ret_fmt` declares the one
    /// expected return type. One call is in flight at a time; concurrent
    /// callers queue on the call lock.
    pub async fn call(
        &self,
        dnode: &str,
        interface: &str,
        args_fmt: &str,
        args: Vec<Value>,
        ret_fmt: &str,
    ) -> Result<Value, ClientError> {
        self.ensure_ready()?;
        ArgFormat::parse(args_fmt)?.check(&args)?;
        let expected = RetFormat::parse(ret_fmt)?
            .kind()
            .ok_or_else(|| ClientError::Proto(ProtoError::BadFormat(ret_fmt.to_string())))?;

        let _guard = self.call_lock.lock().await;
        self.ensure_ready()?;

        let snode = self.shared.node_name();
        let (tx, rx) = oneshot::channel();
        self.shared.park_waiter(tx);

        let env = Envelope::call(&snode, dnode, interface, args);
        if let Err(err) = self.shared.send(&env).await {
            self.shared.take_waiter();
            return Err(err);
        }

        match tokio::time::timeout(self.config.call_timeout, rx).await {
            Err(_) => {
                self.shared.take_waiter();
                warn!(%dnode, %interface, "call timed out");
                Err(ClientError::CallTimeout)
            }
            // Receive task went away with the waiter still parked.
            Ok(Err(_)) => Err(ClientError::CallFailed),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Ok(Ok(value))) => {
                if value.kind() != expected {
                    return Err(ClientError::TypeMismatch {
                        expected,
                        actual: value.kind(),
                    });
                }
                Ok(value)
            }
        }
    }

    /// Tell the daemon we are leaving, then tear the session down. Safe
    /// to call more than once.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        if self.shared.state() == SessionState::Off {
            return Ok(());
        }
        let name = self.shared.node_name();
        if !name.is_empty() {
            // Best effort; the daemon also cleans up on plain disconnect.
            if let Err(err) = self.shared.send(&Envelope::exit(&name)).await {
                debug!(%err, "exit envelope not sent");
            }
        }
        self.shared.set_state(SessionState::Off);
        self.shared.fail_call();
        // Dropping the write half signals EOF even if the exit was lost.
        *self.shared.writer.lock().await = None;

        let task = self
            .rx_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut task) = task {
            if tokio::time::timeout(self.config.exit_grace, &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
        info!(node = %name, "session closed");
        Ok(())
    }

    fn ensure_ready(&self) -> Result<(), ClientError> {
        if self.shared.state() == SessionState::Initialised {
            Ok(())
        } else {
            Err(ClientError::NotInitialized)
        }
    }
}

async fn receive_loop(shared: Arc<Shared>, mut reader: OwnedReadHalf, ready: oneshot::Sender<()>) {
    debug!("receive task up");
    let _ = ready.send(());
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    loop {
        if shared.state() == SessionState::Off {
            break;
        }
        match reader.read(&mut buf).await {
            Ok(0) => {
                if shared.state() != SessionState::Off {
                    warn!("connection to daemon lost");
                }
                shared.set_state(SessionState::Off);
                shared.fail_call();
                break;
            }
            Ok(n) => handle_inbound(&shared, &buf[..n]).await,
            Err(err) => {
                if shared.state() == SessionState::Off {
                    break;
                }
                warn!(%err, "socket read error");
            }
        }
    }
    debug!("receive task down");
}

async fn handle_inbound(shared: &Arc<Shared>, raw: &[u8]) {
    let env = match Envelope::decode(raw) {
        Ok(env) => env,
        Err(err) => {
            warn!(%err, "discarding undecodable message");
            return;
        }
    };
    match env.api {
        // A call envelope carrying a return record is the daemon telling
        // us our own call could not be routed.
        Api::Call if env.is_call_failure() => {
            debug!(interface = env.interface.as_deref().unwrap_or(""), "call rejected by daemon");
            shared.complete_call(Err(ClientError::CallFailed));
        }
        Api::Call => dispatch_reverse_call(shared, env).await,
        Api::Return => {
            let outcome = match env.ret {
                Some(value) => Ok(value),
                None => Err(ClientError::CallFailed),
            };
            shared.complete_call(outcome);
        }
        Api::Ack => {
            let status = env.ret.and_then(|v| v.as_int()).unwrap_or(-1);
            if status == 0 {
                info!("registration acknowledged");
            } else {
                warn!(status, "registration rejected");
            }
        }
        Api::Register | Api::Exit => {
            warn!(api = ?env.api, snode = %env.snode, "unexpected envelope");
        }
    }
}

/// Run the local handler for an inbound call and reply. Any failure on
/// this side still produces a reply, so the caller is never left hanging
/// on its timeout for a mistake of ours.
async fn dispatch_reverse_call(shared: &Arc<Shared>, env: Envelope) {
    let interface = env.interface.unwrap_or_default();
    let caller = env.snode;
    let node_name = shared.node_name();

    let iface = shared
        .interfaces
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .get(&interface)
        .cloned();

    let reply_value = match iface {
        None => {
            warn!(%interface, %caller, "call for unknown interface");
            Value::Int(-1)
        }
        Some(iface) => {
            let values = env.args.unwrap_or_default();
            let declared = iface
                .descriptor()
                .validate()
                .ok()
                .and_then(|(_, ret)| ret.kind());
            match iface.handler.invoke(Args::new(&values)) {
                Ok(value) => match declared {
                    Some(kind) if value.kind() == kind => value,
                    Some(kind) => {
                        warn!(%interface, expected = %kind, actual = %value.kind(),
                              "handler returned wrong type");
                        Value::Int(-1)
                    }
                    // Interfaces declared without a return reply with a
                    // plain status.
                    None => Value::Int(0),
                },
                Err(err) => {
                    warn!(%interface, %err, "handler failed");
                    Value::Int(-1)
                }
            }
        }
    };

    let reply = Envelope::ret(&node_name, &caller, &interface, reply_value);
    if let Err(err) = shared.send(&reply).await {
        warn!(%err, %caller, "cannot send return");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_state_ladder_on_connect_and_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = SessionConfig {
            daemon_addr: listener.local_addr().unwrap(),
            ..SessionConfig::default()
        };
        // Keep the accepted socket alive for the session's lifetime.
        let peer = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let session = ClientSession::connect(config).await.unwrap();
        assert_eq!(session.state(), SessionState::Initialised);

        session.shutdown().await.unwrap();
        assert_eq!(session.state(), SessionState::Off);
        peer.abort();
    }

    #[tokio::test]
    async fn test_connect_failure_maps_to_connect_failed() {
        // Bind then drop, so the port is very likely unoccupied.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let config = SessionConfig {
            daemon_addr: addr,
            ..SessionConfig::default()
        };
        let err = ClientSession::connect(config).await.unwrap_err();
        assert!(matches!(err, ClientError::ConnectFailed(_)), "got {err:?}");
    }

    #[test]
    fn test_state_round_trips_through_u8() {
        for state in [
            SessionState::Off,
            SessionState::Connecting,
            SessionState::Connected,
            SessionState::Initialised,
        ] {
            assert_eq!(SessionState::from_u8(state as u8), state);
        }
    }
}
